pub mod change;
pub mod kind;
