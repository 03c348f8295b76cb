/// Protocol version reported by the server's info endpoint
pub const PROTOCOL_VERSION: &str = "/parley/1.0.0";

/// Application name
pub const APP_NAME: &str = "Parley";

/// Header carrying the caller identity, set by the authentication layer
pub const USER_ID_HEADER: &str = "x-user-id";

/// Query parameter carrying the user id in the WebSocket handshake
pub const HANDSHAKE_USER_PARAM: &str = "userId";

/// Default maximum message text length in characters
pub const DEFAULT_MAX_TEXT_LEN: usize = 4000;

/// Maximum reaction length in bytes (an emoji with modifiers fits easily)
pub const MAX_EMOJI_LEN: usize = 32;

/// Maximum image reference (URL) length in bytes
pub const MAX_IMAGE_REF_LEN: usize = 2048;

/// Push notification body is truncated to this many characters
pub const PUSH_BODY_PREVIEW_LEN: usize = 120;

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;
