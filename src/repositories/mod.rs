pub(crate) mod audit;
pub(crate) mod health;
pub(crate) mod queue;
pub(crate) mod result_criteria;
pub(crate) mod results;
