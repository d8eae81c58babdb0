//! Validation of unit strings.
//!
//! Units are only checked for well-formedness at setup; conversion between
//! units belongs to the model-graph layer. A unit expression is a product of
//! factors joined by `*` and `/`, where each factor is a known symbol with an
//! optional SI prefix and an optional integer exponent (`m**2`, `s^-1`), a
//! plain number, or a parenthesized sub-expression.
//!
//! ```
//! use tessera::units::validate_units;
//!
//! assert!(validate_units("kg*m/s**2").is_ok());
//! assert!(validate_units("kW*h").is_ok());
//! assert!(validate_units("foobar/baz").is_err());
//! ```

/// Error for malformed unit strings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnitsError {
    #[error("The units '{0}' are invalid.")]
    Invalid(String),
}

const SYMBOLS: &[&str] = &[
    // base and derived SI
    "m", "s", "g", "K", "A", "mol", "cd", "N", "Pa", "J", "W", "Hz", "V", "C", "F", "ohm", "S",
    "T", "H", "rad", "sr", "L", "Wb",
    // non-SI in common engineering use
    "degC", "degF", "degR", "deg", "min", "h", "d", "year", "inch", "ft", "mi", "nmi", "lbf",
    "lbm", "psi", "bar", "atm", "Btu", "cal", "mph", "kn", "rpm", "percent", "unitless",
];

const PREFIXES: &[&str] =
    &["Y", "Z", "E", "P", "T", "G", "M", "k", "h", "da", "d", "c", "m", "u", "n", "p", "f", "a"];

fn is_symbol(token: &str) -> bool {
    if SYMBOLS.contains(&token) {
        return true;
    }
    PREFIXES.iter().any(|p| token.strip_prefix(p).is_some_and(|rest| SYMBOLS.contains(&rest)))
}

struct Parser<'a> {
    chars: Vec<char>,
    pos: usize,
    src: &'a str,
}

impl<'a> Parser<'a> {
    fn fail(&self) -> UnitsError {
        UnitsError::Invalid(self.src.to_string())
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn expression(&mut self) -> Result<(), UnitsError> {
        self.factor()?;
        loop {
            self.skip_ws();
            match self.peek() {
                Some('*') if self.chars.get(self.pos + 1) != Some(&'*') => self.pos += 1,
                Some('/') => self.pos += 1,
                _ => return Ok(()),
            }
            self.factor()?;
        }
    }

    fn factor(&mut self) -> Result<(), UnitsError> {
        self.skip_ws();
        match self.peek() {
            Some('(') => {
                self.pos += 1;
                self.expression()?;
                self.skip_ws();
                if self.peek() != Some(')') {
                    return Err(self.fail());
                }
                self.pos += 1;
            }
            Some(c) if c.is_ascii_digit() => self.number()?,
            Some(c) if c.is_ascii_alphabetic() => {
                let start = self.pos;
                while self.peek().is_some_and(|c| c.is_ascii_alphabetic() || c == '_') {
                    self.pos += 1;
                }
                let token: String = self.chars[start..self.pos].iter().collect();
                if !is_symbol(&token) {
                    return Err(self.fail());
                }
            }
            _ => return Err(self.fail()),
        }
        self.exponent()
    }

    fn number(&mut self) -> Result<(), UnitsError> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit() || c == '.') {
            self.pos += 1;
        }
        let token: String = self.chars[start..self.pos].iter().collect();
        token.parse::<f64>().map(|_| ()).map_err(|_| self.fail())
    }

    fn exponent(&mut self) -> Result<(), UnitsError> {
        self.skip_ws();
        let marker_len = match (self.peek(), self.chars.get(self.pos + 1)) {
            (Some('*'), Some('*')) => 2,
            (Some('^'), _) => 1,
            _ => return Ok(()),
        };
        self.pos += marker_len;
        self.skip_ws();
        if self.peek() == Some('-') {
            self.pos += 1;
        }
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.fail());
        }
        Ok(())
    }
}

/// Checks that a unit string is well formed.
pub fn validate_units(units: &str) -> Result<(), UnitsError> {
    let mut parser = Parser { chars: units.chars().collect(), pos: 0, src: units };
    parser.expression()?;
    parser.skip_ws();
    if parser.pos != parser.chars.len() {
        return Err(parser.fail());
    }
    Ok(())
}
