use std::net::IpAddr;

use rand::Rng;

use crate::weights::WeightItem;

/// Which selector a freshly loaded table hands to its domains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    Randomized,
    Deterministic,
}

impl SelectionMode {
    pub fn from_deterministic(deterministic: bool) -> Self {
        if deterministic {
            SelectionMode::Deterministic
        } else {
            SelectionMode::Randomized
        }
    }
}

/// Computes the expected top IP for the next answer
///
/// - Randomized: weighted sampling, P(ip) = weight / weight_sum per draw
/// - Deterministic: each IP is on top `weight` times in a row, in sorted order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Randomized { weight_sum: u32 },
    Deterministic { cursor: usize, repeats: u32 },
}

impl Selector {
    pub fn new(mode: SelectionMode, weights: &[WeightItem]) -> Self {
        match mode {
            SelectionMode::Randomized => Selector::Randomized {
                weight_sum: weights.iter().map(|w| w.value as u32).sum(),
            },
            SelectionMode::Deterministic => Selector::Deterministic { cursor: 0, repeats: 0 },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Selector::Randomized { .. } => "randomized",
            Selector::Deterministic { .. } => "deterministic",
        }
    }

    /// Pick the next top IP and advance. `weights` must be the sorted list
    /// this selector was built for. None only when the list is empty.
    pub fn next_top<R: Rng + ?Sized>(&mut self, weights: &[WeightItem], rng: &mut R) -> Option<IpAddr> {
        if weights.is_empty() {
            return None;
        }
        match self {
            Selector::Randomized { weight_sum } => {
                if *weight_sum == 0 {
                    return None;
                }
                let v = rng.gen_range(0..*weight_sum);
                let mut partial = 0u32;
                for w in weights {
                    partial += w.value as u32;
                    if v < partial {
                        return Some(w.address);
                    }
                }
                weights.last().map(|w| w.address)
            }
            Selector::Deterministic { cursor, repeats } => {
                if *cursor >= weights.len() {
                    *cursor = 0;
                    *repeats = 0;
                }
                let current = weights[*cursor];
                *repeats += 1;
                if *repeats >= current.value as u32 {
                    *repeats = 0;
                    *cursor = (*cursor + 1) % weights.len();
                }
                Some(current.address)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    fn item(ip: &str, value: u8) -> WeightItem {
        WeightItem { address: ip.parse().unwrap(), value }
    }

    #[test]
    fn test_deterministic_cycle() {
        let weights = vec![item("10.0.0.1", 20), item("10.0.0.2", 10)];
        let mut selector = Selector::new(SelectionMode::Deterministic, &weights);
        let mut rng = StdRng::seed_from_u64(1);
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();

        for cycle in 0..5 {
            for i in 0..20 {
                assert_eq!(selector.next_top(&weights, &mut rng), Some(a), "cycle {cycle} A#{i}");
            }
            for i in 0..10 {
                assert_eq!(selector.next_top(&weights, &mut rng), Some(b), "cycle {cycle} B#{i}");
            }
        }
    }

    #[test]
    fn test_deterministic_weight_one_entries() {
        let weights = vec![item("::3", 1), item("::2", 1), item("::1", 1)];
        let mut selector = Selector::new(SelectionMode::Deterministic, &weights);
        let mut rng = StdRng::seed_from_u64(1);
        let seen: Vec<String> = (0..6)
            .map(|_| selector.next_top(&weights, &mut rng).unwrap().to_string())
            .collect();
        assert_eq!(seen, vec!["::3", "::2", "::1", "::3", "::2", "::1"]);
    }

    #[test]
    fn test_randomized_weight_sum() {
        let weights = vec![item("10.0.0.1", 20), item("10.0.0.2", 10)];
        assert_eq!(
            Selector::new(SelectionMode::Randomized, &weights),
            Selector::Randomized { weight_sum: 30 }
        );
    }

    #[test]
    fn test_randomized_distribution_converges() {
        let weights = vec![item("10.0.0.1", 50), item("10.0.0.2", 30), item("10.0.0.3", 20)];
        let mut selector = Selector::new(SelectionMode::Randomized, &weights);
        let mut rng = StdRng::seed_from_u64(42);
        let trials = 100_000;

        let mut counts: HashMap<IpAddr, u32> = HashMap::new();
        for _ in 0..trials {
            let top = selector.next_top(&weights, &mut rng).unwrap();
            *counts.entry(top).or_insert(0) += 1;
        }

        for w in &weights {
            let expected = w.value as f64 / 100.0;
            let actual = counts[&w.address] as f64 / trials as f64;
            assert!(
                (actual - expected).abs() < 0.01,
                "{} expected {:.3} got {:.3}", w.address, expected, actual
            );
        }
    }

    #[test]
    fn test_randomized_same_seed_same_sequence() {
        let weights = vec![item("10.0.0.1", 3), item("10.0.0.2", 2), item("10.0.0.3", 1)];
        let run = |seed| {
            let mut selector = Selector::new(SelectionMode::Randomized, &weights);
            let mut rng = StdRng::seed_from_u64(seed);
            (0..50).map(|_| selector.next_top(&weights, &mut rng)).collect::<Vec<_>>()
        };
        assert_eq!(run(7), run(7));
    }

    #[test]
    fn test_empty_weights_no_expectation() {
        let mut rng = StdRng::seed_from_u64(1);
        for mode in [SelectionMode::Randomized, SelectionMode::Deterministic] {
            let mut selector = Selector::new(mode, &[]);
            assert_eq!(selector.next_top(&[], &mut rng), None);
        }
    }
}
