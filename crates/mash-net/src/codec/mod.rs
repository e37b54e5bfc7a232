mod message;
pub use message::Message;

mod param;
pub use param::Param;
