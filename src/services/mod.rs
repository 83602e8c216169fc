pub mod image;
pub mod llm;
pub mod retry;
pub mod session;
pub mod setup;
pub mod turn;
