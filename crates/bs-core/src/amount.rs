//! Helpers for job bodies turning scraped display strings into
//! [`Amount`]s and canonical currency labels.

use crate::types::Amount;

/// Parse a displayed amount such as `$ 1.234,56`, `US$ 100,00` or
/// `1,234.56`.
///
/// When both separators appear, whichever comes last is the decimal
/// separator. A lone comma is a decimal comma. `number` is `None` when no
/// digits are found.
pub fn parse_amount(raw: &str) -> Amount {
    Amount {
        raw: raw.to_string(),
        number: parse_number(raw),
    }
}

fn parse_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    let start = trimmed.find(|c: char| c.is_ascii_digit() || c == '.' || c == ',')?;
    let numeric: String = trimmed[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    if !numeric.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let normalized = match (numeric.rfind(','), numeric.rfind('.')) {
        (Some(comma), Some(dot)) if comma > dot => numeric.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => numeric.replace(',', ""),
        (Some(_), None) => numeric.replace(',', "."),
        _ => numeric,
    };

    let negative = trimmed[..start].contains('-');
    normalized
        .parse::<f64>()
        .ok()
        .map(|n| if negative { -n } else { n })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrencyFormat {
    /// `$`, `U$S`, `€`
    Symbol,
    /// `uyu`, `usd`, `eur`
    Code,
}

const CURRENCIES: &[(&[&str], &str, &str)] = &[
    (&["USD", "U$S", "US$", "DÓLARES", "DOLARES"], "U$S", "usd"),
    (&["EUR", "€", "EUROS"], "€", "eur"),
    (&["UYU", "$", "PESOS"], "$", "uyu"),
];

/// Map the many ways a source spells a currency to one label.
///
/// Empty input means pesos. Unrecognised input is returned unchanged
/// (lower-cased for [`CurrencyFormat::Code`]).
pub fn normalize_currency(raw: &str, format: CurrencyFormat) -> String {
    let upper = raw.trim().to_uppercase();
    if upper.is_empty() {
        return match format {
            CurrencyFormat::Symbol => "$".into(),
            CurrencyFormat::Code => "uyu".into(),
        };
    }

    // Dollar spellings contain "$", so they are checked before pesos.
    for (patterns, symbol, code) in CURRENCIES {
        if patterns.iter().any(|p| upper.contains(p)) {
            return match format {
                CurrencyFormat::Symbol => (*symbol).into(),
                CurrencyFormat::Code => (*code).into(),
            };
        }
    }

    match format {
        CurrencyFormat::Symbol => raw.to_string(),
        CurrencyFormat::Code => raw.to_lowercase(),
    }
}
