use crate::common::*;
use std::borrow::Cow;

/// Wall-clock durations of consecutive stages.
#[derive(Debug, Clone)]
pub struct Timing {
    instant: Instant,
    elapsed: Vec<(String, Duration)>,
}

impl Default for Timing {
    fn default() -> Self {
        Self::new()
    }
}

impl Timing {
    pub fn new() -> Self {
        Self {
            instant: Instant::now(),
            elapsed: vec![],
        }
    }

    /// Close the current stage under `name` and start the next one.
    pub fn set_record<'a>(&mut self, name: impl Into<Cow<'a, str>>) {
        self.elapsed
            .push((name.into().into_owned(), self.instant.elapsed()));
        self.instant = Instant::now();
    }

    /// Add `duration` to the stage `name`, creating it if needed.
    pub fn add_record<'a>(&mut self, name: impl Into<Cow<'a, str>>, duration: Duration) {
        let name = name.into();
        match self.elapsed.iter_mut().find(|(stage, _)| *stage == name) {
            Some((_, total)) => *total += duration,
            None => self.elapsed.push((name.into_owned(), duration)),
        }
    }

    pub fn records(&self) -> &[(String, Duration)] {
        &self.elapsed
    }

    pub fn report(&self) {
        for (name, elapsed) in &self.elapsed {
            info!("{} time: {:.4}s", name, elapsed.as_secs_f64());
        }
    }
}
