pub(crate) mod errors;
pub(crate) mod handlers;
pub(crate) mod pagination;
pub(crate) mod queue;
pub(crate) mod results;
pub(crate) mod router;
