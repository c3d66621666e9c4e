/// Application name
pub const APP_NAME: &str = "Time Capsule Cloud";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Maximum upload size in bytes (100 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 100 * 1024 * 1024;

/// Default HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default unlock scan cadence in seconds (10 minutes)
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 600;

/// Default number of capsules unlocked concurrently within one scan
pub const DEFAULT_SCAN_CONCURRENCY: usize = 4;

/// Default per-capsule storage timeout in seconds
pub const DEFAULT_ITEM_TIMEOUT_SECS: u64 = 30;

/// Page size used when walking the due-capsule listing
pub const DUE_PAGE_SIZE: usize = 100;

/// File name given to message-only capsules
pub const MESSAGE_FILENAME: &str = "message.txt";

/// File extensions accepted for uploads
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "txt", "pdf", "png", "jpg", "jpeg", "gif", "mp4", "avi", "mov", "mp3", "wav", "ogg", "m4a",
    "aac", "flac",
];

/// Notification kind emitted when a capsule is released
pub const NOTIFICATION_CAPSULE_RELEASE: &str = "capsule_release";

/// How far ahead the dashboard looks for upcoming unlocks, in days
pub const UPCOMING_WINDOW_DAYS: i64 = 7;
