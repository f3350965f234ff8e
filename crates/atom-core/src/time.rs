//! Frame clock for the Atom engine
//!
//! Turns raw wall-clock deltas into the clamped, scaled `delta_time` handed
//! to `World::update`, and accumulates fixed simulation steps.

use serde::{Deserialize, Serialize};

/// Configuration for the frame clock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Simulated seconds per real second
    pub time_scale: f32,
    /// Fixed simulation step (in seconds)
    pub fixed_timestep: f32,
    /// Upper bound for a single frame delta, to avoid a spiral of death
    pub max_delta_time: f32,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            time_scale: 1.0,
            fixed_timestep: 1.0 / 60.0,
            max_delta_time: 0.25,
        }
    }
}

impl ClockConfig {
    pub fn validate(&self) -> Result<(), ClockError> {
        if !(self.fixed_timestep > 0.0) {
            return Err(ClockError::InvalidFixedTimestep(self.fixed_timestep));
        }
        if !(self.max_delta_time > 0.0) {
            return Err(ClockError::InvalidMaxDelta(self.max_delta_time));
        }
        if !(self.time_scale >= 0.0) {
            return Err(ClockError::NegativeTimeScale(self.time_scale));
        }
        Ok(())
    }
}

/// Errors raised for an unusable clock configuration
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClockError {
    #[error("fixed timestep must be positive, got {0}")]
    InvalidFixedTimestep(f32),

    #[error("max delta time must be positive, got {0}")]
    InvalidMaxDelta(f32),

    #[error("time scale cannot be negative, got {0}")]
    NegativeTimeScale(f32),
}

/// Per-frame time tracking
#[derive(Debug, Clone, Default)]
pub struct FrameClock {
    config: ClockConfig,
    /// Simulated seconds since start
    pub total_time: f64,
    /// Delta for this frame (clamped and scaled)
    pub delta_time: f32,
    /// Delta for this frame (clamped only)
    pub unscaled_delta_time: f32,
    pub frame_count: u64,
    pub paused: bool,
    fixed_accumulator: f32,
}

impl FrameClock {
    pub fn new(config: ClockConfig) -> Result<Self, ClockError> {
        config.validate()?;
        Ok(Self {
            config,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &ClockConfig {
        &self.config
    }

    /// Advance by the raw delta measured since the previous frame and return
    /// the delta the simulation should use.
    pub fn tick(&mut self, raw_delta: f32) -> f32 {
        self.unscaled_delta_time = raw_delta.clamp(0.0, self.config.max_delta_time);
        self.frame_count += 1;

        if self.paused {
            self.delta_time = 0.0;
            return 0.0;
        }

        self.delta_time = self.unscaled_delta_time * self.config.time_scale;
        self.total_time += self.delta_time as f64;
        self.fixed_accumulator += self.delta_time;
        self.delta_time
    }

    /// Number of fixed steps due this frame; consumes them from the
    /// accumulator.
    pub fn fixed_steps(&mut self) -> u32 {
        let mut steps = 0;
        while self.fixed_accumulator >= self.config.fixed_timestep {
            self.fixed_accumulator -= self.config.fixed_timestep;
            steps += 1;
        }
        steps
    }

    /// Interpolation factor between the last two fixed steps
    pub fn fixed_interpolation(&self) -> f32 {
        self.fixed_accumulator / self.config.fixed_timestep
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Set the time scale (0.0 = frozen, 1.0 = normal, 2.0 = double speed)
    pub fn set_time_scale(&mut self, scale: f32) {
        self.config.time_scale = scale.max(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_clamps_and_scales() {
        let mut clock = FrameClock::new(ClockConfig {
            time_scale: 2.0,
            ..Default::default()
        })
        .unwrap();

        assert_eq!(clock.tick(0.1), 0.2);
        assert_eq!(clock.tick(5.0), 0.5);
        assert_eq!(clock.unscaled_delta_time, 0.25);
        assert_eq!(clock.frame_count, 2);
    }

    #[test]
    fn paused_clock_yields_zero_delta() {
        let mut clock = FrameClock::default();
        clock.pause();
        assert_eq!(clock.tick(0.016), 0.0);
        assert_eq!(clock.total_time, 0.0);
        assert_eq!(clock.frame_count, 1);
        clock.resume();
        assert!(clock.tick(0.016) > 0.0);
    }

    #[test]
    fn fixed_steps_accumulate() {
        let mut clock = FrameClock::new(ClockConfig {
            fixed_timestep: 0.1,
            ..Default::default()
        })
        .unwrap();
        clock.tick(0.25);
        assert_eq!(clock.fixed_steps(), 2);
        assert_eq!(clock.fixed_steps(), 0);
        assert!((clock.fixed_interpolation() - 0.5).abs() < 1e-4);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = ClockConfig {
            fixed_timestep: 0.0,
            ..Default::default()
        };
        assert_eq!(
            FrameClock::new(config).unwrap_err(),
            ClockError::InvalidFixedTimestep(0.0)
        );
    }
}
