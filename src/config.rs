use crate::{continuous::Integrator, SimError};

#[derive(Debug, Clone, Default)]
pub struct SimConfig {
    pub integrator: Option<Integrator>,
    pub dispatch_log_capacity: Option<usize>,
}

impl SimConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the integration method and its fixed step
    pub fn with_integrator(mut self, integrator: Integrator) -> Self {
        self.integrator = Some(integrator);
        self
    }

    /// Record up to `capacity` dispatched events
    pub fn with_dispatch_log(mut self, capacity: usize) -> Self {
        self.dispatch_log_capacity = Some(capacity);
        self
    }

    /// Validate that all configured fields are usable
    pub fn validate(&self) -> Result<(), SimError> {
        if let Some(integrator) = self.integrator {
            let step = integrator.step();
            if !(step.is_finite() && step > 0.0) {
                return Err(SimError::ConfigError(format!(
                    "integration step must be finite and positive, got {step}"
                )));
            }
        }

        if self.dispatch_log_capacity == Some(0) {
            return Err(SimError::ConfigError(
                "dispatch log capacity must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::Simulator;

    #[test]
    fn test_validate_rejects_bad_step() {
        let config = SimConfig::new().with_integrator(Integrator::Euler { step: 0.0 });
        assert!(matches!(config.validate(), Err(SimError::ConfigError(_))));

        let config = SimConfig::new().with_integrator(Integrator::RungeKutta4 { step: f64::NAN });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_log() {
        let config = SimConfig::new().with_dispatch_log(0);
        assert!(matches!(config.validate(), Err(SimError::ConfigError(_))));
    }

    #[test]
    fn test_from_config_applies_settings() {
        let config = SimConfig::new()
            .with_integrator(Integrator::RungeKutta2 { step: 0.25 })
            .with_dispatch_log(16);
        assert!(config.validate().is_ok());

        let sim = Simulator::from_config(&config).unwrap();
        assert_eq!(sim.integrator(), Some(Integrator::RungeKutta2 { step: 0.25 }));
        assert!(sim.dispatch_log().is_some());
    }
}
