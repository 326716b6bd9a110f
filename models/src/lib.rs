pub mod constants;
pub mod duration;
pub mod node;
pub mod pod;
