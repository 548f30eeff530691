use std::convert::TryFrom;
use tokio::time::Duration;

#[derive(Clone, Default)]
pub struct FederationOptions {
    /// How long to wait for a remote server when fetching a missing state ancestor.
    pub state_fetch_timeout: Option<Duration>,
    /// How long to wait for a remote server when fetching a missing ancestor of a received PDU.
    pub backfill_fetch_timeout: Option<Duration>,
    pub queue_buffer_size: Option<usize>,
    /// Upper bound on PDUs visited while looking for the common ancestor of two state branches.
    pub max_state_walk_hops: Option<usize>,
    pub default_pagination_limit: Option<usize>,
}

#[derive(Debug)]
pub(super) struct FederationOptionsValidated {
    pub state_fetch_timeout: Duration,
    pub backfill_fetch_timeout: Duration,
    pub queue_buffer_size: usize,
    pub max_state_walk_hops: usize,
    pub default_pagination_limit: usize,
}

impl FederationOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.state_fetch_timeout == Duration::from_millis(0) {
            return Err("State fetch timeout must be non-zero");
        }
        if self.backfill_fetch_timeout == Duration::from_millis(0) {
            return Err("Backfill fetch timeout must be non-zero");
        }
        if self.queue_buffer_size == 0 {
            return Err("Queue buffer size must be greater than 0");
        }
        if self.max_state_walk_hops == 0 {
            return Err("State walk hop limit must be greater than 0");
        }
        if self.default_pagination_limit == 0 {
            return Err("Default pagination limit must be greater than 0");
        }

        Ok(())
    }
}

impl TryFrom<FederationOptions> for FederationOptionsValidated {
    type Error = &'static str;

    fn try_from(options: FederationOptions) -> Result<Self, Self::Error> {
        let values = FederationOptionsValidated {
            state_fetch_timeout: options.state_fetch_timeout.unwrap_or(Duration::from_secs(5)),
            backfill_fetch_timeout: options.backfill_fetch_timeout.unwrap_or(Duration::from_secs(5)),
            queue_buffer_size: options.queue_buffer_size.unwrap_or(64),
            max_state_walk_hops: options.max_state_walk_hops.unwrap_or(1024),
            default_pagination_limit: options.default_pagination_limit.unwrap_or(10),
        };

        values.validate()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = FederationOptionsValidated::try_from(FederationOptions::default()).unwrap();

        assert_eq!(options.state_fetch_timeout, Duration::from_secs(5));
        assert_eq!(options.backfill_fetch_timeout, Duration::from_secs(5));
        assert_eq!(options.queue_buffer_size, 64);
        assert_eq!(options.max_state_walk_hops, 1024);
        assert_eq!(options.default_pagination_limit, 10);
    }

    #[test]
    fn overrides_are_kept() {
        let options = FederationOptionsValidated::try_from(FederationOptions {
            state_fetch_timeout: Some(Duration::from_millis(20)),
            default_pagination_limit: Some(3),
            ..FederationOptions::default()
        })
        .unwrap();

        assert_eq!(options.state_fetch_timeout, Duration::from_millis(20));
        assert_eq!(options.default_pagination_limit, 3);
        assert_eq!(options.queue_buffer_size, 64);
    }

    #[test]
    fn zero_values_are_rejected() {
        let zero_timeout = FederationOptions {
            backfill_fetch_timeout: Some(Duration::from_millis(0)),
            ..FederationOptions::default()
        };
        let zero_hops = FederationOptions {
            max_state_walk_hops: Some(0),
            ..FederationOptions::default()
        };
        let zero_buffer = FederationOptions {
            queue_buffer_size: Some(0),
            ..FederationOptions::default()
        };

        assert!(FederationOptionsValidated::try_from(zero_timeout).is_err());
        assert!(FederationOptionsValidated::try_from(zero_hops).is_err());
        assert!(FederationOptionsValidated::try_from(zero_buffer).is_err());
    }
}
