use std::time::Duration;

use chromiumoxide::element::Element;
use rand::Rng;
use tokio::time::sleep;

use crate::config::HumanSimulationSection;

use super::error::{BrowserError, BrowserResult};

/// Paces clicks and keystrokes on the real site so forms receive input
/// events at the rate their scripts expect.
#[derive(Debug, Clone)]
pub struct InputPacer {
    config: HumanSimulationSection,
}

impl InputPacer {
    pub fn new(config: HumanSimulationSection) -> Self {
        Self { config }
    }

    pub fn disabled() -> Self {
        Self {
            config: HumanSimulationSection {
                enabled: false,
                ..HumanSimulationSection::default()
            },
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub async fn hesitate(&self) {
        let delay = self.hesitation();
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }

    pub async fn step_pause(&self) {
        let delay = self.random_duration(self.config.step_pause_ms);
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }

    /// Types `text` one character at a time into a focused element.
    pub async fn type_text(&self, element: &Element, text: &str) -> BrowserResult<()> {
        if !self.config.enabled {
            element.type_str(text).await.map_err(|err| {
                BrowserError::Unexpected(format!("failed to type text: {err}"))
            })?;
            return Ok(());
        }
        for ch in text.chars() {
            element.type_str(ch.to_string()).await.map_err(|err| {
                BrowserError::Unexpected(format!("failed to type character: {err}"))
            })?;
            sleep(self.typing_delay()).await;
        }
        Ok(())
    }

    pub fn hesitation(&self) -> Duration {
        self.random_duration(self.config.click_hesitation_ms)
    }

    pub fn typing_delay(&self) -> Duration {
        if !self.config.enabled {
            return Duration::ZERO;
        }
        let [low, high] = ordered(self.config.typing_cadence_cpm);
        let mut rng = rand::thread_rng();
        let cadence = rng.gen_range(low..=high).max(60) as f64;
        let base_delay = 60.0 / cadence;
        let [jitter_low, jitter_high] = ordered(self.config.typing_jitter_ms);
        let jitter_ms = rng.gen_range(jitter_low..=jitter_high);
        Duration::from_secs_f64(base_delay + jitter_ms as f64 / 1000.0)
    }

    fn random_duration(&self, bounds: [u32; 2]) -> Duration {
        if !self.config.enabled {
            return Duration::ZERO;
        }
        let [low, high] = ordered(bounds);
        Duration::from_millis(rand::thread_rng().gen_range(low..=high) as u64)
    }
}

fn ordered(bounds: [u32; 2]) -> [u32; 2] {
    if bounds[0] <= bounds[1] {
        bounds
    } else {
        [bounds[1], bounds[0]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_stay_within_configured_bounds() {
        let pacer = InputPacer::new(HumanSimulationSection {
            enabled: true,
            click_hesitation_ms: [100, 200],
            typing_cadence_cpm: [300, 300],
            typing_jitter_ms: [10, 10],
            step_pause_ms: [0, 0],
        });
        for _ in 0..50 {
            let hesitation = pacer.hesitation();
            assert!(hesitation >= Duration::from_millis(100));
            assert!(hesitation <= Duration::from_millis(200));
        }
        let typing = pacer.typing_delay();
        assert!(typing >= Duration::from_millis(209) && typing <= Duration::from_millis(211));
    }

    #[test]
    fn disabled_pacer_never_waits() {
        let pacer = InputPacer::disabled();
        assert_eq!(pacer.hesitation(), Duration::ZERO);
        assert_eq!(pacer.typing_delay(), Duration::ZERO);
    }
}
