mod rampup;

pub use rampup::{
    PhaseMode, RampPhase, RampUpCalculator, RampUpExecution, RampUpStrategy, RampUpType,
};

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::PlanError;

/// Parses a duration string such as `5m`, `30s`, or `200ms`.
pub fn parse_duration(value: &str) -> Result<Duration, PlanError> {
    humantime::parse_duration(value).map_err(|source| PlanError::InvalidDuration {
        value: value.to_owned(),
        source,
    })
}

/// Parses a duration string, falling back to `default` on any error.
pub fn parse_duration_or(value: &str, default: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl HttpMethod {
    pub fn as_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Delete => reqwest::Method::DELETE,
            Self::Patch => reqwest::Method::PATCH,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub think_time: Option<String>,
}

impl Endpoint {
    /// Endpoint-specific think time if parseable, `default` otherwise.
    pub fn effective_think_time(&self, default: Duration) -> Duration {
        self.think_time
            .as_deref()
            .and_then(|value| humantime::parse_duration(value).ok())
            .unwrap_or(default)
    }
}

/// Declarative description of the load a run generates. Immutable once
/// submitted; agents receive it verbatim inside the START command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestPlan {
    pub name: String,
    pub duration: String,
    pub concurrency: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ramp_up_strategy: Option<RampUpStrategy>,
    pub endpoints: Vec<Endpoint>,
}

impl TestPlan {
    /// Validates the plan for submission.
    ///
    /// # Errors
    ///
    /// Returns the first violation: empty endpoints, unparseable durations,
    /// an invalid ramp-up strategy, or a relative endpoint URL.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.endpoints.is_empty() {
            return Err(PlanError::EmptyEndpoints);
        }
        if self.concurrency == 0 {
            return Err(PlanError::ZeroConcurrency);
        }
        parse_duration(&self.duration)?;

        for (index, endpoint) in self.endpoints.iter().enumerate() {
            let parsed = Url::parse(&endpoint.url).ok();
            let absolute = parsed
                .as_ref()
                .is_some_and(|url| matches!(url.scheme(), "http" | "https"));
            if !absolute {
                return Err(PlanError::InvalidEndpointUrl {
                    index,
                    url: endpoint.url.clone(),
                });
            }
        }

        if let Some(strategy) = &self.ramp_up_strategy {
            strategy.validate(self.concurrency)?;
        }

        Ok(())
    }

    pub fn parsed_duration(&self) -> Result<Duration, PlanError> {
        parse_duration(&self.duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(url: &str) -> Endpoint {
        Endpoint {
            method: HttpMethod::Get,
            url: url.to_owned(),
            headers: BTreeMap::new(),
            body: None,
            think_time: None,
        }
    }

    fn plan() -> TestPlan {
        TestPlan {
            name: "checkout".to_owned(),
            duration: "2m".to_owned(),
            concurrency: 10,
            ramp_up_strategy: None,
            endpoints: vec![endpoint("http://localhost:9000/cart")],
        }
    }

    #[test]
    fn valid_plan_passes() {
        assert!(plan().validate().is_ok());
    }

    #[test]
    fn empty_endpoints_rejected() {
        let mut plan = plan();
        plan.endpoints.clear();
        assert!(matches!(plan.validate(), Err(PlanError::EmptyEndpoints)));
    }

    #[test]
    fn bad_duration_rejected() {
        let mut plan = plan();
        plan.duration = "soon".to_owned();
        assert!(matches!(
            plan.validate(),
            Err(PlanError::InvalidDuration { .. })
        ));
    }

    #[test]
    fn relative_url_rejected() {
        let mut plan = plan();
        plan.endpoints = vec![endpoint("/cart")];
        assert!(matches!(
            plan.validate(),
            Err(PlanError::InvalidEndpointUrl { index: 0, .. })
        ));
    }

    #[test]
    fn think_time_falls_back_to_default() {
        let mut ep = endpoint("http://localhost:9000/");
        assert_eq!(
            ep.effective_think_time(Duration::from_millis(50)),
            Duration::from_millis(50)
        );
        ep.think_time = Some("200ms".to_owned());
        assert_eq!(
            ep.effective_think_time(Duration::from_millis(50)),
            Duration::from_millis(200)
        );
        ep.think_time = Some("not-a-duration".to_owned());
        assert_eq!(
            ep.effective_think_time(Duration::from_millis(50)),
            Duration::from_millis(50)
        );
    }

    #[test]
    fn method_serializes_uppercase() {
        let json = serde_json::to_string(&HttpMethod::Delete).unwrap();
        assert_eq!(json, "\"DELETE\"");
    }
}
