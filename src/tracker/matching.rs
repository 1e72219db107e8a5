//! Matching utilities for cross-camera fusion.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::Hash;

use ndarray::Array2;

/// Cost used for padding and for pairs that may never match.
pub const INFEASIBLE: f64 = 1e6;

/// Ground-plane (x, y) Euclidean distance matrix between objects and detections.
pub fn distance_matrix(objects: &[[f64; 2]], detections: &[[f64; 2]]) -> Array2<f64> {
    let mut dists = Array2::zeros((objects.len(), detections.len()));
    for (i, o) in objects.iter().enumerate() {
        for (j, d) in detections.iter().enumerate() {
            dists[[i, j]] = ((o[0] - d[0]).powi(2) + (o[1] - d[1]).powi(2)).sqrt();
        }
    }
    dists
}

#[derive(Debug, Clone, Default)]
pub struct AssignmentResult {
    pub matches: Vec<(usize, usize)>,
    pub unmatched_objects: Vec<usize>,
    pub unmatched_detections: Vec<usize>,
}

/// Optimal one-to-one assignment of rows (objects) to columns (detections); pairs costing
/// more than `thresh` are left unmatched.
pub fn linear_assignment(cost_matrix: &Array2<f64>, thresh: f64) -> AssignmentResult {
    let (num_rows, num_cols) = cost_matrix.dim();

    if num_rows == 0 {
        return AssignmentResult {
            matches: vec![],
            unmatched_objects: vec![],
            unmatched_detections: (0..num_cols).collect(),
        };
    }

    if num_cols == 0 {
        return AssignmentResult {
            matches: vec![],
            unmatched_objects: (0..num_rows).collect(),
            unmatched_detections: vec![],
        };
    }

    let size = num_rows.max(num_cols);
    let mut padded = Array2::<f64>::from_elem((size, size), INFEASIBLE);

    for i in 0..num_rows {
        for j in 0..num_cols {
            // out-of-gate pairs must not pull the solution away from feasible ones
            let cost = cost_matrix[[i, j]];
            padded[[i, j]] = if cost <= thresh { cost } else { INFEASIBLE };
        }
    }

    let mut matches = vec![];
    let mut unmatched_objects = vec![];
    let mut unmatched_detections_mask: Vec<bool> = vec![true; num_cols];

    match lapjv::lapjv(&padded) {
        Ok((row_to_col, _)) => {
            for (row_idx, &col_idx) in row_to_col.iter().enumerate() {
                if row_idx >= num_rows {
                    continue;
                }
                if col_idx < num_cols && cost_matrix[[row_idx, col_idx]] <= thresh {
                    matches.push((row_idx, col_idx));
                    unmatched_detections_mask[col_idx] = false;
                } else {
                    unmatched_objects.push(row_idx);
                }
            }
        }
        Err(e) => {
            tracing::warn!(error = ?e, "assignment solver failed, leaving all unmatched");
            unmatched_objects = (0..num_rows).collect();
        }
    }

    let unmatched_detections: Vec<usize> = unmatched_detections_mask
        .iter()
        .enumerate()
        .filter_map(|(i, &u)| if u { Some(i) } else { None })
        .collect();

    AssignmentResult {
        matches,
        unmatched_objects,
        unmatched_detections,
    }
}

/// A request to bind a detection to an object.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim<K, T> {
    pub target: K,
    pub distance: f64,
    /// Tie-breaker when distances are equal: camera id, then detection index.
    pub source: (String, usize),
    pub item: T,
}

/// Resolve claims on the same target: the smallest distance wins, equal distances go to
/// the smaller source. Returns `(winners, losers)`.
pub fn resolve_conflicts<K, T>(claims: Vec<Claim<K, T>>) -> (Vec<Claim<K, T>>, Vec<Claim<K, T>>)
where
    K: Eq + Hash + Clone,
{
    let mut best: HashMap<K, usize> = HashMap::new();
    for (idx, claim) in claims.iter().enumerate() {
        match best.get(&claim.target) {
            Some(&current) if !beats(claim, &claims[current]) => {}
            _ => {
                best.insert(claim.target.clone(), idx);
            }
        }
    }
    let mut winners = Vec::new();
    let mut losers = Vec::new();
    for (idx, claim) in claims.into_iter().enumerate() {
        if best.get(&claim.target) == Some(&idx) {
            winners.push(claim);
        } else {
            losers.push(claim);
        }
    }
    (winners, losers)
}

fn beats<K, T>(a: &Claim<K, T>, b: &Claim<K, T>) -> bool {
    match a.distance.total_cmp(&b.distance) {
        Ordering::Less => true,
        Ordering::Greater => false,
        Ordering::Equal => a.source < b.source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_matrix() {
        let d = distance_matrix(&[[0.0, 0.0]], &[[3.0, 4.0], [0.0, 1.0]]);
        assert_eq!(d.dim(), (1, 2));
        assert_eq!(d[[0, 0]], 5.0);
        assert_eq!(d[[0, 1]], 1.0);
    }

    #[test]
    fn test_assignment_is_optimal_and_gated() {
        // greedy would give object 0 detection 0 and leave object 1 out of gate
        let cost = distance_matrix(&[[0.0, 0.0], [1.5, 0.0]], &[[1.0, 0.0], [-0.5, 0.0]]);
        let result = linear_assignment(&cost, 1.0);
        let mut matches = result.matches.clone();
        matches.sort();
        assert_eq!(matches, vec![(0, 1), (1, 0)]);

        let far = distance_matrix(&[[0.0, 0.0]], &[[10.0, 0.0]]);
        let result = linear_assignment(&far, 2.0);
        assert!(result.matches.is_empty());
        assert_eq!(result.unmatched_objects, vec![0]);
        assert_eq!(result.unmatched_detections, vec![0]);
    }

    #[test]
    fn test_empty_inputs() {
        let cost = Array2::<f64>::zeros((0, 3));
        let result = linear_assignment(&cost, 1.0);
        assert_eq!(result.unmatched_detections, vec![0, 1, 2]);
    }

    #[test]
    fn test_smaller_distance_wins() {
        let claims = vec![
            Claim { target: 7, distance: 0.9, source: ("cam-a".into(), 0), item: "a" },
            Claim { target: 7, distance: 0.4, source: ("cam-b".into(), 0), item: "b" },
            Claim { target: 8, distance: 1.5, source: ("cam-a".into(), 1), item: "c" },
        ];
        let (winners, losers) = resolve_conflicts(claims);
        let won: Vec<_> = winners.iter().map(|c| c.item).collect();
        assert_eq!(won, vec!["b", "c"]);
        assert_eq!(losers.len(), 1);
        assert_eq!(losers[0].item, "a");
    }

    #[test]
    fn test_tie_goes_to_smaller_source() {
        let claims = vec![
            Claim { target: 1, distance: 0.5, source: ("cam-b".into(), 0), item: 0 },
            Claim { target: 1, distance: 0.5, source: ("cam-a".into(), 3), item: 1 },
        ];
        let (winners, _) = resolve_conflicts(claims);
        assert_eq!(winners[0].item, 1);
    }
}
