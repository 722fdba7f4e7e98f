pub(crate) mod enqueue;
pub(crate) mod gradebook;
pub(crate) mod grading;
pub(crate) mod oracle;
pub(crate) mod review;
pub(crate) mod rubric;
pub(crate) mod similarity;
pub(crate) mod submission_source;
pub(crate) mod text;
