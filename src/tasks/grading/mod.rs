mod maintenance;
mod worker;

pub(crate) use maintenance::{purge_expired, recover_stale_claims, resync_gradebook};
pub(crate) use worker::run_pass;
