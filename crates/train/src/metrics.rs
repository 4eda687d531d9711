//! Scoring helpers.

/// Index of the largest value in each row. Ties go to the lower index;
/// NaN never wins.
pub fn argmax_rows(rows: &[Vec<f32>]) -> Vec<u32> {
    rows.iter().map(|row| argmax(row)).collect()
}

pub fn argmax(row: &[f32]) -> u32 {
    let mut best = 0usize;
    for (i, &v) in row.iter().enumerate() {
        if v > row[best] || row[best].is_nan() {
            best = i;
        }
    }
    best as u32
}

/// Fraction of positions where `predicted == expected`; `None` when empty
/// or the lengths differ.
pub fn accuracy(predicted: &[u32], expected: &[u32]) -> Option<f32> {
    if predicted.is_empty() || predicted.len() != expected.len() {
        return None;
    }
    let correct = predicted.iter().zip(expected).filter(|(p, e)| p == e).count();
    Some(correct as f32 / predicted.len() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argmax_picks_first_max() {
        assert_eq!(argmax(&[0.1, 0.7, 0.7]), 1);
        assert_eq!(argmax(&[f32::NAN, -1.0]), 1);
        assert_eq!(argmax_rows(&[vec![3.0, 1.0], vec![0.0, 2.0]]), vec![0, 1]);
    }

    #[test]
    fn accuracy_counts_matches() {
        assert_eq!(accuracy(&[0, 1, 2, 2], &[0, 1, 1, 2]), Some(0.75));
        assert_eq!(accuracy(&[], &[]), None);
        assert_eq!(accuracy(&[1], &[1, 2]), None);
    }
}
