/// Useful enumerations for trigger objects and cut comparisons.
pub mod enums;
/// Four-momenta and the angular helpers used by the selection ($`\Delta R`$, $`\Delta\phi`$,
/// $`m_T`$).
pub mod vectors;

/// Format a cut threshold the way step names spell it: `2.4 -> "2p4"`, `26.0 -> "26"`.
pub fn threshold_tag(value: f64) -> String {
    let formatted = format!("{}", value);
    let formatted = formatted.strip_suffix(".0").unwrap_or(&formatted);
    formatted.replace('.', "p").replace('-', "m")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_tag() {
        assert_eq!(threshold_tag(26.0), "26");
        assert_eq!(threshold_tag(2.4), "2p4");
        assert_eq!(threshold_tag(0.045), "0p045");
        assert_eq!(threshold_tag(-1.5), "m1p5");
    }
}
