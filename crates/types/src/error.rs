use thiserror::Error;

/// Cube bounds where a minimum exceeds its maximum.
///
/// Raised while validating job options, before anything is sent to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {axis} range: min {min} is greater than max {max}")]
pub struct InvalidRangeError {
    pub axis: char,
    pub min: i64,
    pub max: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_range_display() {
        let err = InvalidRangeError {
            axis: 'x',
            min: 10,
            max: -4,
        };
        assert_eq!(
            err.to_string(),
            "invalid x range: min 10 is greater than max -4"
        );
    }
}
