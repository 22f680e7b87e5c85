use opthub_protocol::KnapsackData;
use opthub_protocol::TspData;

/// TSP fitness over a continuous candidate via random-key decoding: the
/// tour visits cities in the order of the candidate's sorted component
/// ranks, so any real-valued vector of length `n` encodes a permutation.
/// Returns the closed tour length (minimize).
pub fn tsp_fitness(tsp: &TspData) -> impl Fn(&[f64]) -> f64 + Send + Sync + use<> {
    let cities = tsp.cities.clone();
    move |keys: &[f64]| {
        let mut order: Vec<usize> = (0..cities.len().min(keys.len())).collect();
        order.sort_by(|&a, &b| keys[a].total_cmp(&keys[b]));
        let mut length = 0.0;
        for i in 0..order.len() {
            let from = cities[order[i]];
            let to = cities[order[(i + 1) % order.len()]];
            length += ((from[0] - to[0]).powi(2) + (from[1] - to[1]).powi(2)).sqrt();
        }
        length
    }
}

/// Knapsack fitness over a continuous candidate: component > 0.5 selects
/// the item. Feasible selections score their total value (maximize);
/// overweight selections score the negative excess so the search is pulled
/// back toward feasibility instead of plateauing at zero.
pub fn knapsack_fitness(knapsack: &KnapsackData) -> impl Fn(&[f64]) -> f64 + Send + Sync + use<> {
    let weights = knapsack.weights.clone();
    let values = knapsack.values.clone();
    let capacity = knapsack.capacity;
    move |candidate: &[f64]| {
        let mut total_weight = 0.0;
        let mut total_value = 0.0;
        for (i, selected) in candidate.iter().enumerate().take(weights.len()) {
            if *selected > 0.5 {
                total_weight += weights[i];
                total_value += values[i];
            }
        }
        if total_weight > capacity {
            capacity - total_weight
        } else {
            total_value
        }
    }
}

#[cfg(test)]
mod tests {
    use opthub_protocol::KnapsackData;
    use opthub_protocol::TspData;
    use pretty_assertions::assert_eq;

    use super::knapsack_fitness;
    use super::tsp_fitness;

    #[test]
    fn tsp_unit_square_tour_has_length_four() {
        let tsp = TspData {
            cities: vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]],
        };
        let fitness = tsp_fitness(&tsp);
        // Keys already in visiting order walk the square's perimeter.
        assert_eq!(fitness(&[0.1, 0.2, 0.3, 0.4]), 4.0);
        // A crossing tour is strictly longer.
        assert!(fitness(&[0.1, 0.3, 0.2, 0.4]) > 4.0);
    }

    #[test]
    fn knapsack_scores_value_when_feasible() {
        let knapsack = KnapsackData {
            weights: vec![2.0, 3.0, 4.0],
            values: vec![10.0, 20.0, 30.0],
            capacity: 6.0,
        };
        let fitness = knapsack_fitness(&knapsack);
        assert_eq!(fitness(&[1.0, 1.0, 0.0]), 30.0);
        assert_eq!(fitness(&[0.0, 0.0, 1.0]), 30.0);
    }

    #[test]
    fn knapsack_penalizes_overweight_selections() {
        let knapsack = KnapsackData {
            weights: vec![2.0, 3.0, 4.0],
            values: vec![10.0, 20.0, 30.0],
            capacity: 6.0,
        };
        let fitness = knapsack_fitness(&knapsack);
        assert_eq!(fitness(&[1.0, 1.0, 1.0]), -3.0);
    }
}
