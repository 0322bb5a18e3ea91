pub mod enhance;
pub mod output;
pub mod utils;
