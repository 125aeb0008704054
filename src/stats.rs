//! Statistics collected over a run: [`Tally`] summarises independent observations and
//! [`Accumulate`] gives the time-weighted average of a piecewise-constant quantity.
use std::fmt::Write;

/// Common reporting surface of the collectors.
pub trait StatProbe {
    fn name(&self) -> &str;
    /// Discard everything collected so far.
    fn init(&mut self);
    fn min(&self) -> f64;
    fn max(&self) -> f64;
    fn average(&self) -> f64;

    fn report(&self) -> String {
        format!(
            "{:<28} min {:>12.4} max {:>12.4} avg {:>12.4}",
            self.name(),
            self.min(),
            self.max(),
            self.average()
        )
    }
}

/// Summary of a sequence of observations. Empty tallies report `NaN` averages.
#[derive(Clone, Debug)]
pub struct Tally {
    name: String,
    count: u64,
    sum: f64,
    sum_sq: f64,
    min: f64,
    max: f64,
}

impl Tally {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            count: 0,
            sum: 0.0,
            sum_sq: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn add(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.sum_sq += value * value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Sample variance; `NaN` with fewer than two observations.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            return f64::NAN;
        }
        let n = self.count as f64;
        let mean = self.sum / n;
        ((self.sum_sq - n * mean * mean) / (n - 1.0)).max(0.0)
    }

    pub fn standard_deviation(&self) -> f64 {
        self.variance().sqrt()
    }
}

impl StatProbe for Tally {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self) {
        *self = Self::new(std::mem::take(&mut self.name));
    }

    fn min(&self) -> f64 {
        self.min
    }

    fn max(&self) -> f64 {
        self.max
    }

    fn average(&self) -> f64 {
        if self.count == 0 {
            f64::NAN
        } else {
            self.sum / self.count as f64
        }
    }

    fn report(&self) -> String {
        let mut line = format!(
            "{:<28} min {:>12.4} max {:>12.4} avg {:>12.4}",
            self.name,
            self.min,
            self.max,
            self.average()
        );
        let _ = write!(line, " sd {:>10.4} n {}", self.standard_deviation(), self.count);
        line
    }
}

/// Time-weighted average of a value that changes at discrete instants.
#[derive(Clone, Debug)]
pub struct Accumulate {
    name: String,
    start: f64,
    last_time: f64,
    last_value: f64,
    area: f64,
    min: f64,
    max: f64,
}

impl Accumulate {
    pub fn new(name: impl Into<String>) -> Self {
        Self::starting(name, 0.0, 0.0)
    }

    fn starting(name: impl Into<String>, time: f64, value: f64) -> Self {
        Self {
            name: name.into(),
            start: time,
            last_time: time,
            last_value: value,
            area: 0.0,
            min: value,
            max: value,
        }
    }

    /// Restart collection at `time` with the quantity currently at `value`.
    pub fn init_at(&mut self, time: f64, value: f64) {
        *self = Self::starting(std::mem::take(&mut self.name), time, value);
    }

    /// The quantity changed to `value` at `time`.
    pub fn update(&mut self, time: f64, value: f64) {
        if time > self.last_time {
            self.area += self.last_value * (time - self.last_time);
            self.last_time = time;
        }
        self.last_value = value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn last(&self) -> f64 {
        self.last_value
    }

    /// Average over `[start, time]`, extending the current value up to `time`.
    pub fn average_at(&self, time: f64) -> f64 {
        let span = time - self.start;
        if span <= 0.0 {
            return self.last_value;
        }
        let tail = self.last_value * (time - self.last_time).max(0.0);
        (self.area + tail) / span
    }
}

impl StatProbe for Accumulate {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self) {
        let (time, value) = (self.last_time, self.last_value);
        self.init_at(time, value);
    }

    fn min(&self) -> f64 {
        self.min
    }

    fn max(&self) -> f64 {
        self.max
    }

    /// Average up to the time of the latest update.
    fn average(&self) -> f64 {
        self.average_at(self.last_time)
    }
}
