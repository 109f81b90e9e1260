use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::warn;

/// Health reporting for the daemon's long-running loops.
///
/// The process can only be trusted with traffic while every loop is
/// actually looping, so each one registers here and reports in as it goes
/// around. A component that stops reporting past its deadline counts as
/// stalled, and any stalled or unhealthy component fails the aggregate
/// check served on the liveness endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentStatus {
    /// Registered but has not reported yet.
    Starting,
    /// Reported healthy; trusted until the deadline passes.
    HealthyUntil(Instant),
    /// Reported unhealthy on purpose.
    Unhealthy,
}

#[derive(Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    /// Component name to a display string of its current state.
    pub components: HashMap<String, String>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

type ComponentMap = Arc<RwLock<HashMap<String, (Duration, ComponentStatus)>>>;

/// Handed to a component so it can report in. Cheap to clone.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    components: ComponentMap,
}

impl HealthHandle {
    /// Must be called more often than the deadline the component
    /// registered with.
    pub fn report_healthy(&self) {
        self.report(|deadline| ComponentStatus::HealthyUntil(Instant::now() + deadline));
    }

    pub fn report_unhealthy(&self) {
        self.report(|_| ComponentStatus::Unhealthy);
    }

    fn report(&self, status: impl FnOnce(Duration) -> ComponentStatus) {
        match self.components.write() {
            Ok(mut map) => {
                if let Some((deadline, state)) = map.get_mut(&self.component) {
                    *state = status(*deadline);
                }
            }
            // A poisoned map means some reporter panicked; the probe will
            // fail and the process gets restarted.
            Err(_) => warn!("poisoned health registry lock"),
        }
    }
}

/// The aggregate view. One registry per probe; all components must be
/// healthy for the registry to report healthy.
#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: ComponentMap,
}

impl HealthRegistry {
    pub fn new(name: &str) -> HealthRegistry {
        HealthRegistry {
            name: name.to_owned(),
            components: Arc::default(),
        }
    }

    /// Registers a component; the returned handle travels with it.
    pub fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        if let Ok(mut map) = self.components.write() {
            map.insert(component.to_owned(), (deadline, ComponentStatus::Starting));
        }
        HealthHandle {
            component: component.to_owned(),
            components: self.components.clone(),
        }
    }

    /// Usable directly as an axum handler through `IntoResponse`.
    pub fn get_status(&self) -> HealthStatus {
        let components = match self.components.read() {
            Ok(map) => map,
            Err(_) => {
                return HealthStatus {
                    healthy: false,
                    components: HashMap::from([(self.name.clone(), "poisoned".to_owned())]),
                }
            }
        };

        let now = Instant::now();
        let mut healthy = !components.is_empty();
        let mut display_map = HashMap::new();
        for (name, (_, status)) in components.iter() {
            let text = match status {
                ComponentStatus::Starting => {
                    healthy = false;
                    "starting".to_owned()
                }
                ComponentStatus::Unhealthy => {
                    healthy = false;
                    "unhealthy".to_owned()
                }
                ComponentStatus::HealthyUntil(until) if *until > now => "healthy".to_owned(),
                ComponentStatus::HealthyUntil(until) => {
                    healthy = false;
                    format!("stalled for {:?}", now - *until)
                }
            };
            display_map.insert(name.clone(), text);
        }

        if !healthy {
            warn!("{} health check failed: {:?}", self.name, display_map);
        }
        HealthStatus {
            healthy,
            components: display_map,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn component_lifecycle() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("router", Duration::from_secs(30));

        // Starting components hold the check red until they report.
        assert!(!registry.get_status().healthy);

        handle.report_healthy();
        assert!(registry.get_status().healthy);

        handle.report_unhealthy();
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(status.components["router"], "unhealthy");
    }

    #[test]
    fn stalled_component_fails_the_check() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("ingest", Duration::from_nanos(1));
        handle.report_healthy();
        std::thread::sleep(Duration::from_millis(5));

        let status = registry.get_status();
        assert!(!status.healthy);
        assert!(status.components["ingest"].starts_with("stalled"));
    }

    #[test]
    fn all_components_must_be_healthy() {
        let registry = HealthRegistry::new("liveness");
        let a = registry.register("a", Duration::from_secs(30));
        let b = registry.register("b", Duration::from_secs(30));

        a.report_healthy();
        assert!(!registry.get_status().healthy);
        b.report_healthy();
        assert!(registry.get_status().healthy);
    }

    #[test]
    fn into_response_status_codes() {
        let registry = HealthRegistry::new("liveness");
        let response = registry.get_status().into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let handle = registry.register("only", Duration::from_secs(30));
        handle.report_healthy();
        let response = registry.get_status().into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
