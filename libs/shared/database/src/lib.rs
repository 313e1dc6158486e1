pub mod locks;
pub mod supabase;

pub use locks::{acquire_with_retry, DistributedLock, LocalLock, LockLease, SupabaseLock};
pub use supabase::{SupabaseClient, SupabaseError};
