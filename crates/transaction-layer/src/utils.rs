use rand::{thread_rng, Rng};
use uuid::Uuid;

/// RFC 3261 magic cookie that prefixes every branch this stack generates.
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// Generate a random branch parameter for a Via header (magic cookie + random string)
pub fn generate_branch() -> String {
    format!("{}-{}", BRANCH_MAGIC_COOKIE, Uuid::new_v4().simple())
}

/// Generate a From/To tag.
pub fn generate_tag() -> String {
    format!("{:08x}", thread_rng().gen::<u32>())
}
