//! Server selection strategies

use relaymail_common::types::StrategyKind;
use std::collections::HashMap;

/// A selection strategy bound to the weights it needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Per-key counter modulo the server count
    RoundRobin,
    /// Global counter over the total weight; `weights[i]` belongs to server `i`
    Weighted { weights: Vec<u32> },
    /// Always the first eligible server
    FirstHealthy,
}

impl Strategy {
    /// Bind a strategy kind to a server list, looking weights up as needed
    pub fn for_servers(kind: StrategyKind, servers: &[String], weight: impl Fn(&str) -> u32) -> Self {
        match kind {
            StrategyKind::RoundRobin => Strategy::RoundRobin,
            StrategyKind::FirstHealthy => Strategy::FirstHealthy,
            StrategyKind::Weighted => Strategy::Weighted {
                weights: servers.iter().map(|s| weight(s)).collect(),
            },
        }
    }
}

/// Mutable counters behind the strategies
#[derive(Debug, Default)]
pub struct SelectionState {
    round_robin: HashMap<String, u64>,
    weighted: u64,
}

impl SelectionState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Pick a server index for `key` and advance the strategy's counter.
///
/// Returns `None` only when `servers` is empty.
pub fn select(strategy: &Strategy, key: &str, servers: &[String], state: &mut SelectionState) -> Option<usize> {
    if servers.is_empty() {
        return None;
    }
    if servers.len() == 1 {
        return Some(0);
    }

    match strategy {
        Strategy::FirstHealthy => Some(0),
        Strategy::RoundRobin => {
            let counter = state.round_robin.entry(key.to_string()).or_insert(0);
            let index = (*counter % servers.len() as u64) as usize;
            *counter = counter.wrapping_add(1);
            Some(index)
        }
        Strategy::Weighted { weights } => {
            let weights: Vec<u64> = (0..servers.len())
                .map(|i| weights.get(i).copied().unwrap_or(1) as u64)
                .collect();
            let total: u64 = weights.iter().sum();
            if total == 0 {
                return Some(0);
            }

            let point = state.weighted % total;
            state.weighted = (state.weighted + 1) % total;

            let mut cumulative = 0;
            for (index, weight) in weights.iter().enumerate() {
                cumulative += weight;
                if point < cumulative {
                    return Some(index);
                }
            }
            Some(servers.len() - 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn servers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_round_robin_cycles_in_order() {
        let servers = servers(&["a", "b", "c"]);
        let mut state = SelectionState::new();

        let picks: Vec<usize> = (0..7)
            .map(|_| select(&Strategy::RoundRobin, "example.com", &servers, &mut state).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_round_robin_is_balanced() {
        let servers = servers(&["a", "b", "c", "d"]);
        let mut state = SelectionState::new();
        let mut visits = vec![0usize; servers.len()];

        let m = 103;
        for _ in 0..m {
            visits[select(&Strategy::RoundRobin, "k", &servers, &mut state).unwrap()] += 1;
        }

        let expected = m / servers.len();
        for count in visits {
            assert!(count == expected || count == expected + 1, "count {}", count);
        }
    }

    #[test]
    fn test_round_robin_counters_are_per_key() {
        let servers = servers(&["a", "b"]);
        let mut state = SelectionState::new();

        assert_eq!(select(&Strategy::RoundRobin, "one.com", &servers, &mut state), Some(0));
        assert_eq!(select(&Strategy::RoundRobin, "two.com", &servers, &mut state), Some(0));
        assert_eq!(select(&Strategy::RoundRobin, "one.com", &servers, &mut state), Some(1));
    }

    #[test]
    fn test_weighted_buckets() {
        let servers = servers(&["a", "b"]);
        let strategy = Strategy::Weighted { weights: vec![3, 1] };
        let mut state = SelectionState::new();

        let picks: Vec<usize> = (0..8)
            .map(|_| select(&strategy, "k", &servers, &mut state).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 0, 0, 1, 0, 0, 0, 1]);
    }

    #[test]
    fn test_weighted_zero_weight_never_chosen() {
        let servers = servers(&["a", "b", "c"]);
        let strategy = Strategy::Weighted { weights: vec![0, 2, 1] };
        let mut state = SelectionState::new();

        for _ in 0..30 {
            assert_ne!(select(&strategy, "k", &servers, &mut state), Some(0));
        }
    }

    #[test]
    fn test_first_healthy() {
        let servers = servers(&["a", "b"]);
        let mut state = SelectionState::new();
        for _ in 0..5 {
            assert_eq!(select(&Strategy::FirstHealthy, "k", &servers, &mut state), Some(0));
        }
    }

    #[test]
    fn test_single_server_any_strategy() {
        let servers = servers(&["only"]);
        let mut state = SelectionState::new();
        for strategy in [
            Strategy::RoundRobin,
            Strategy::FirstHealthy,
            Strategy::Weighted { weights: vec![5] },
        ] {
            for _ in 0..4 {
                assert_eq!(select(&strategy, "k", &servers, &mut state), Some(0));
            }
        }
    }

    #[test]
    fn test_empty_servers() {
        let mut state = SelectionState::new();
        assert_eq!(select(&Strategy::RoundRobin, "k", &[], &mut state), None);
    }

    #[test]
    fn test_for_servers_binds_weights() {
        let servers = servers(&["a", "b"]);
        let strategy = Strategy::for_servers(StrategyKind::Weighted, &servers, |name| {
            if name == "a" { 4 } else { 1 }
        });
        assert_eq!(strategy, Strategy::Weighted { weights: vec![4, 1] });
    }
}
