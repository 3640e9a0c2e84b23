pub mod flow;
pub mod responder;
pub mod surface;
