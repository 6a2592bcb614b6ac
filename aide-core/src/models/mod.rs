pub mod fragment;
pub mod session;
pub mod user;

pub use fragment::KnowledgeFragment;
pub use session::{Message, MessageRole, Session, SessionSummary};
pub use user::User;
