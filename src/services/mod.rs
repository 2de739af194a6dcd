pub mod assessor;
pub mod pipeline;
pub mod window;
