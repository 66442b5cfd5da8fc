pub mod ddg;
pub mod train;
