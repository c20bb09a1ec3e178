pub(crate) mod backend;
pub(crate) mod execution_unit;
pub(crate) mod register_status;
pub(crate) mod reorder_buffer;
pub(crate) mod reservation_station;
