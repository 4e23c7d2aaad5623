use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};

/// Coarse priority band. Earlier variants run first.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PriorityLevel {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

/// A level plus a weight that orders units within the level (higher first).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Priority {
    pub level: PriorityLevel,
    #[serde(default)]
    pub weight: i32,
}

impl Priority {
    pub fn new(level: PriorityLevel, weight: i32) -> Self {
        Self { level, weight }
    }

    pub fn critical() -> Self {
        Self::new(PriorityLevel::Critical, 0)
    }

    pub fn high() -> Self {
        Self::new(PriorityLevel::High, 0)
    }

    pub fn medium() -> Self {
        Self::new(PriorityLevel::Medium, 0)
    }

    pub fn low() -> Self {
        Self::new(PriorityLevel::Low, 0)
    }

    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    fn rank(&self) -> (PriorityLevel, Reverse<i32>) {
        (self.level, Reverse(self.weight))
    }
}

/// `Less` means "runs first".
impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_beats_weight() {
        let urgent = Priority::critical();
        let heavy = Priority::low().with_weight(1_000);
        assert!(urgent < heavy);
    }

    #[test]
    fn higher_weight_runs_first_within_a_level() {
        let mut priorities = vec![
            Priority::high().with_weight(10),
            Priority::medium(),
            Priority::high().with_weight(50),
        ];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![
                Priority::high().with_weight(50),
                Priority::high().with_weight(10),
                Priority::medium(),
            ]
        );
    }

    #[test]
    fn reads_from_config() {
        let priority: Priority = serde_json::from_str(r#"{"level":"critical"}"#).unwrap();
        assert_eq!(priority, Priority::critical());
        assert_eq!(serde_json::to_string(&PriorityLevel::Low).unwrap(), r#""low""#);
    }
}
