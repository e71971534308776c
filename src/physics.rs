use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

const PI2: f64 = PI * 2.0;

/// Kinematic profile of an agent: trapezoidal speed with separate
/// acceleration and deceleration, turning on the spot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Physics {
    pub acceleration: f64,
    pub deceleration: f64,
    pub max_speed: f64,
    /// Seconds needed for a full rotation.
    pub turn_speed: f64,
}

impl Default for Physics {
    fn default() -> Self {
        Physics {
            acceleration: 0.5,
            deceleration: 0.5,
            max_speed: 1.5,
            turn_speed: 2.5,
        }
    }
}

/// Phases of one stop-to-stop move.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Profile {
    start_speed: f64,
    top_speed: f64,
    acceleration_distance: f64,
    acceleration_duration: f64,
    full_speed_distance: f64,
    full_speed_duration: f64,
    deceleration_duration: f64,
}

impl Profile {
    fn duration(&self) -> f64 {
        self.acceleration_duration + self.full_speed_duration + self.deceleration_duration
    }
}

impl Physics {
    pub fn new(acceleration: f64, deceleration: f64, max_speed: f64, turn_speed: f64) -> Self {
        Physics {
            acceleration,
            deceleration,
            max_speed,
            turn_speed,
        }
    }

    pub fn time_from_full_speed_to_zero(&self) -> f64 {
        self.max_speed / self.deceleration
    }

    pub fn distance_to_stop(&self, speed: f64) -> f64 {
        speed * speed / (2.0 * self.deceleration)
    }

    pub fn distance_to_full_speed(&self, speed: f64) -> f64 {
        (self.max_speed * self.max_speed - speed * speed).max(0.0) / (2.0 * self.acceleration)
    }

    fn profile(&self, start_speed: f64, distance: f64) -> Profile {
        let braking_distance = self.distance_to_stop(start_speed);

        // only braking is possible
        if braking_distance >= distance {
            return Profile {
                start_speed,
                top_speed: start_speed,
                acceleration_distance: 0.0,
                acceleration_duration: 0.0,
                full_speed_distance: 0.0,
                full_speed_duration: 0.0,
                deceleration_duration: start_speed / self.deceleration,
            };
        }

        let acceleration_distance = self.distance_to_full_speed(start_speed);
        let full_braking_distance = self.distance_to_stop(self.max_speed);
        if acceleration_distance + full_braking_distance <= distance {
            let full_speed_distance = distance - acceleration_distance - full_braking_distance;
            return Profile {
                start_speed,
                top_speed: self.max_speed,
                acceleration_distance,
                acceleration_duration: (self.max_speed - start_speed).max(0.0) / self.acceleration,
                full_speed_distance,
                full_speed_duration: full_speed_distance / self.max_speed,
                deceleration_duration: self.time_from_full_speed_to_zero(),
            };
        }

        // full speed is never reached
        let (a, d) = (self.acceleration, self.deceleration);
        let top_speed = ((2.0 * a * d * distance + start_speed * start_speed * d) / (a + d)).sqrt();
        Profile {
            start_speed,
            top_speed,
            acceleration_distance: (top_speed * top_speed - start_speed * start_speed) / (2.0 * a),
            acceleration_duration: (top_speed - start_speed) / a,
            full_speed_distance: 0.0,
            full_speed_duration: 0.0,
            deceleration_duration: top_speed / d,
        }
    }

    /// Time to cover `distance` starting at `start_speed` and stopping at the end.
    pub fn time_to_move(&self, start_speed: f64, distance: f64) -> f64 {
        if distance <= 0.0 {
            return 0.0;
        }
        self.profile(start_speed, distance).duration()
    }

    /// Absolute passing times at each checkpoint distance of a single move
    /// of `total_distance` started at `start_time`.
    pub fn checkpoint_times(
        &self,
        start_speed: f64,
        start_time: f64,
        total_distance: f64,
        checkpoint_distances: &[f64],
    ) -> Vec<f64> {
        if total_distance <= 0.0 {
            return vec![start_time; checkpoint_distances.len()];
        }
        let profile = self.profile(start_speed, total_distance);
        let total_time = profile.duration();

        checkpoint_distances
            .iter()
            .map(|&distance| {
                if distance >= total_distance {
                    return start_time + total_time;
                }
                start_time + self.time_at_distance(&profile, distance.max(0.0))
            })
            .collect()
    }

    fn time_at_distance(&self, profile: &Profile, distance: f64) -> f64 {
        let v0 = profile.start_speed;
        if distance <= profile.acceleration_distance {
            return ((2.0 * self.acceleration * distance + v0 * v0).sqrt() - v0) / self.acceleration;
        }
        if distance <= profile.acceleration_distance + profile.full_speed_distance {
            return profile.acceleration_duration
                + (distance - profile.acceleration_distance) / profile.top_speed;
        }
        let braking = distance - profile.acceleration_distance - profile.full_speed_distance;
        let top = profile.top_speed;
        let remaining = (top * top - 2.0 * self.deceleration * braking).max(0.0);
        profile.acceleration_duration
            + profile.full_speed_duration
            + (top - remaining.sqrt()) / self.deceleration
    }

    /// Distance covered and resulting speed after `elapsed` seconds of a
    /// stop-to-stop move over `total_distance`.
    pub fn progress_after(&self, start_speed: f64, total_distance: f64, elapsed: f64) -> (f64, f64) {
        if total_distance <= 0.0 || elapsed <= 0.0 {
            return (0.0, start_speed);
        }
        let profile = self.profile(start_speed, total_distance);
        if elapsed >= profile.duration() {
            return (total_distance, 0.0);
        }

        let t = elapsed;
        if t <= profile.acceleration_duration {
            let speed = start_speed + self.acceleration * t;
            return (start_speed * t + self.acceleration * t * t / 2.0, speed);
        }
        let t = t - profile.acceleration_duration;
        if t <= profile.full_speed_duration {
            return (
                profile.acceleration_distance + profile.top_speed * t,
                profile.top_speed,
            );
        }
        let t = t - profile.full_speed_duration;
        let distance = profile.acceleration_distance
            + profile.full_speed_distance
            + profile.top_speed * t
            - self.deceleration * t * t / 2.0;
        (
            distance.min(total_distance),
            (profile.top_speed - self.deceleration * t).max(0.0),
        )
    }

    pub fn time_to_turn(&self, current_orientation: f64, target_orientation: f64) -> f64 {
        orientation_difference(current_orientation, target_orientation).abs() / PI2 * self.turn_speed
    }

    pub fn orientation_after(&self, current: f64, target: f64, elapsed: f64) -> f64 {
        let difference = orientation_difference(current, target);
        let change = (elapsed * (PI2 / self.turn_speed)).min(difference.abs());
        if difference < 0.0 {
            current - change
        } else {
            current + change
        }
    }
}

/// Signed shortest rotation from `current` to `target`, positive clockwise.
fn orientation_difference(current: f64, target: f64) -> f64 {
    let difference = if target > current {
        target - current
    } else {
        target - current + PI2
    };
    if difference < PI {
        difference
    } else {
        difference - PI2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit() -> Physics {
        Physics::new(1.0, 1.0, 1.0, 4.0)
    }

    #[test]
    fn test_time_to_move_situations() {
        let physics = unit();
        // accelerate 0.5, full speed 1.0, decelerate 0.5
        assert!((physics.time_to_move(0.0, 2.0) - 3.0).abs() < 1e-9);
        // triangular: peak speed sqrt(0.5)
        let peak = 0.5f64.sqrt();
        assert!((physics.time_to_move(0.0, 0.5) - 2.0 * peak).abs() < 1e-9);
        // full speed, then brake
        assert!((physics.time_to_move(1.0, 2.0) - 2.5).abs() < 1e-9);
        // braking only
        assert!((physics.time_to_move(1.0, 0.25) - 1.0).abs() < 1e-9);
        assert_eq!(physics.time_to_move(0.0, 0.0), 0.0);
    }

    #[test]
    fn test_checkpoint_times() {
        let physics = unit();
        let times = physics.checkpoint_times(0.0, 10.0, 2.0, &[0.0, 0.5, 1.5, 2.0]);
        assert_eq!(times.len(), 4);
        assert!((times[0] - 10.0).abs() < 1e-9);
        assert!((times[1] - 11.0).abs() < 1e-9);
        assert!((times[2] - 12.0).abs() < 1e-9);
        assert!((times[3] - 13.0).abs() < 1e-9);
        assert!(times.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn test_progress_after() {
        let physics = unit();
        let (distance, speed) = physics.progress_after(0.0, 2.0, 1.0);
        assert!((distance - 0.5).abs() < 1e-9);
        assert!((speed - 1.0).abs() < 1e-9);
        assert_eq!(physics.progress_after(0.0, 2.0, 5.0), (2.0, 0.0));
    }

    #[test]
    fn test_turning() {
        let physics = unit();
        assert!((physics.time_to_turn(0.0, PI) - 2.0).abs() < 1e-9);
        assert!((physics.time_to_turn(0.0, 1.5 * PI) - 1.0).abs() < 1e-9);
        assert!((physics.orientation_after(0.0, PI / 2.0, 0.5) - PI / 4.0).abs() < 1e-9);
        assert!((physics.orientation_after(0.0, 1.5 * PI, 10.0) + PI / 2.0).abs() < 1e-9);
    }
}
