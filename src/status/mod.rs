//! Parity-encoded status channels.
//!
//! The logger stores on/off flags with an offset so several of them can be stacked on one chart;
//! only the parity of the stored value carries the state. Decoding yields `1` while on and a
//! missing value while off, so a plotted line breaks instead of drawing a flat zero.

/// Decode a raw status series: odd values are on (`1`), even values and missing values are missing.
pub fn decode_status(raw: &[Option<f64>]) -> Vec<Option<f64>> {
    raw.iter().map(|value| decode_sample(*value)).collect()
}

fn decode_sample(value: Option<f64>) -> Option<f64> {
    let value = value.filter(|v| v.is_finite())?;
    let parity = (value.trunc() as i64).rem_euclid(2);
    (parity == 1).then_some(1.0)
}

/// Blank every sample of `values` where the decoded `mask` is off.
pub fn apply_mask(values: &[Option<f64>], mask: &[Option<f64>]) -> Vec<Option<f64>> {
    values
        .iter()
        .zip(mask.iter())
        .map(|(value, on)| on.and(*value))
        .collect()
}

/// Lift a decoded series to `level` so stacked channels don't overlap.
pub fn stack_level(decoded: &[Option<f64>], level: usize) -> Vec<Option<f64>> {
    decoded.iter().map(|v| v.map(|on| on * level as f64)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_parity_sequence() {
        let raw: Vec<Option<f64>> = (0..6).map(|v| Some(v as f64)).collect();
        let decoded = decode_status(&raw);
        assert_eq!(decoded, vec![None, Some(1.0), None, Some(1.0), None, Some(1.0)]);
    }

    #[test]
    fn test_decode_keeps_length_and_missing() {
        let raw = vec![None, Some(11.0), Some(f64::NAN), Some(-3.0), Some(10.0)];
        let decoded = decode_status(&raw);
        assert_eq!(decoded.len(), raw.len());
        assert_eq!(decoded, vec![None, Some(1.0), None, Some(1.0), None]);
    }

    #[test]
    fn test_apply_mask() {
        let values = vec![Some(1.5), Some(2.5), None, Some(4.5)];
        let mask = vec![Some(1.0), None, Some(1.0), Some(1.0)];
        assert_eq!(apply_mask(&values, &mask), vec![Some(1.5), None, None, Some(4.5)]);
    }

    #[test]
    fn test_stack_level() {
        let decoded = vec![Some(1.0), None];
        assert_eq!(stack_level(&decoded, 3), vec![Some(3.0), None]);
    }
}
