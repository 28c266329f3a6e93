//! Pitch and gain conversion helpers.

// -------------------------------------------------------------------------------------------------

const MINUS_INF_IN_DB: f32 = -200.0f32;

// -------------------------------------------------------------------------------------------------

/// Convert a pitch offset in cents to a playback frequency ratio, using the standard
/// equal-tempered formula `2^(cents/1200)`.
pub fn cents_to_ratio(cents: f64) -> f64 {
    if cents == 0.0 {
        return 1.0; // avoid rounding errors at exactly 0 cents
    }
    (cents / 1200.0).exp2()
}

// -------------------------------------------------------------------------------------------------

pub fn db_to_linear(value: f32) -> f32 {
    const DB_TO_LIN_FACTOR: f32 = std::f32::consts::LN_10 / 20.0f32;
    if value == 0.0f32 {
        return 1.0f32; // avoid rounding errors at exactly 0 dB
    } else if value > MINUS_INF_IN_DB {
        return (value * DB_TO_LIN_FACTOR).exp();
    }
    0.0f32
}

// -------------------------------------------------------------------------------------------------

pub fn linear_to_db(value: f32) -> f32 {
    const LIN_TO_DB_FACTOR: f32 = 20.0f32 / std::f32::consts::LN_10;
    if value == 1.0 {
        return 0.0; // avoid rounding errors at exactly 0 dB
    } else if value > 1e-12f32 {
        return value.ln() * LIN_TO_DB_FACTOR;
    }
    MINUS_INF_IN_DB
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cent_conversion() {
        assert_eq!(cents_to_ratio(0.0), 1.0);
        assert!((cents_to_ratio(1200.0) - 2.0).abs() < 1e-12);
        assert!((cents_to_ratio(-1200.0) - 0.5).abs() < 1e-12);
        assert!((cents_to_ratio(700.0) - 1.4983070768766815).abs() < 1e-9);
    }

    #[test]
    fn db_conversion() {
        assert_eq!(db_to_linear(0.0), 1.0);
        assert_eq!(linear_to_db(1.0), 0.0);
        assert!((db_to_linear(-6.0) - 0.5012).abs() < 1e-3);
        assert!((linear_to_db(db_to_linear(-12.5)) - -12.5).abs() < 1e-4);
        assert_eq!(db_to_linear(MINUS_INF_IN_DB - 1.0), 0.0);
    }
}
