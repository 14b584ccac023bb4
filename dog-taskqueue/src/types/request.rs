use super::{JobId, PriorityTier};

/// Submission data for a new job
#[derive(Debug, Clone)]
pub struct SubmitRequest<P> {
    /// Opaque payload, never inspected by the queue
    pub payload: P,

    /// Rate-limiting key
    pub owner_key: String,

    /// Lane the job is scheduled in
    pub tier: PriorityTier,

    /// Jobs that must succeed first
    pub depends_on: Vec<JobId>,

    /// Caller-supplied identifier (generated when absent)
    pub job_id: Option<JobId>,

    /// Overrides the configured retry budget for this job
    pub max_retries: Option<u32>,
}

impl<P> SubmitRequest<P> {
    /// Create a request at the default tier with no dependencies
    pub fn new(payload: P, owner_key: impl Into<String>) -> Self {
        Self {
            payload,
            owner_key: owner_key.into(),
            tier: PriorityTier::default(),
            depends_on: Vec::new(),
            job_id: None,
            max_retries: None,
        }
    }

    /// Set the priority tier
    pub fn with_tier(mut self, tier: PriorityTier) -> Self {
        self.tier = tier;
        self
    }

    /// Add a dependency
    pub fn depends_on(mut self, job_id: impl Into<JobId>) -> Self {
        self.depends_on.push(job_id.into());
        self
    }

    /// Replace the dependency set
    pub fn with_dependencies<I>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = JobId>,
    {
        self.depends_on = deps.into_iter().collect();
        self
    }

    /// Use a caller-supplied job identifier
    pub fn with_job_id(mut self, job_id: impl Into<JobId>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Set the maximum retry attempts for this job
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}
