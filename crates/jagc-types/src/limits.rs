/// Caps on the per-scope pending image buffer. Telegram bots cannot fetch
/// files above 20 MiB and an album holds at most 10 photos, so these bound
/// what a single text message can ever claim.
pub const MAX_INPUT_IMAGE_COUNT: usize = 10;
pub const MAX_INPUT_IMAGE_TOTAL_BYTES: usize = 15 * 1024 * 1024;

/// How long a pending image stays claimable before it is purged.
pub const PENDING_IMAGE_TTL_SECONDS: i64 = 30 * 60;
