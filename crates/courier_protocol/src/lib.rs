#![forbid(unsafe_code)]

pub mod packet;

pub use packet::{ErrorResp, Header, LogicPkt, Meta, Status};

/// Command names carried in `Header::command`.
pub mod command {
	pub const SIGN_IN: &str = "login.signin";
	pub const SIGN_OUT: &str = "login.signout";

	pub const CHAT_USER_TALK: &str = "chat.user.talk";
	pub const CHAT_GROUP_TALK: &str = "chat.group.talk";
	pub const CHAT_TALK_ACK: &str = "chat.talk.ack";

	pub const OFFLINE_INDEX: &str = "chat.offline.index";
	pub const OFFLINE_CONTENT: &str = "chat.offline.content";

	pub const GROUP_CREATE: &str = "chat.group.create";
	pub const GROUP_JOIN: &str = "chat.group.join";
	pub const GROUP_QUIT: &str = "chat.group.quit";
	pub const GROUP_DETAIL: &str = "chat.group.detail";
}

