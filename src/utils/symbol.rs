// src/utils/symbol.rs

/// Quote currencies recognised when a symbol has no separator (e.g. `BTCUSDT`).
const KNOWN_QUOTES: [&str; 7] = ["USDT", "USDC", "BUSD", "KRW", "BTC", "ETH", "BNB"];

/// Splits a symbol into (base, quote).
///
/// Accepts the standard `BASE/QUOTE` form, dash-separated pairs and
/// concatenated pairs ending in a known quote currency. Dash pairs are read
/// base-first (`BTC-USDT`) except in Upbit's quote-first layout: a `KRW`
/// prefix, or a known quote followed by something that is not one (`USDT-XRP`).
pub fn split_symbol(symbol: &str) -> Option<(String, String)> {
    let upper = symbol.trim().to_ascii_uppercase();

    if let Some((base, quote)) = upper.split_once('/') {
        return non_empty_pair(base, quote);
    }

    if let Some((first, second)) = upper.split_once('-') {
        let quote_first = first == "KRW"
            || (KNOWN_QUOTES.contains(&first) && !KNOWN_QUOTES.contains(&second));
        if quote_first {
            return non_empty_pair(second, first);
        }
        return non_empty_pair(first, second);
    }

    KNOWN_QUOTES
        .iter()
        .find(|quote| upper.len() > quote.len() && upper.ends_with(*quote))
        .and_then(|quote| non_empty_pair(&upper[..upper.len() - quote.len()], quote))
}

pub fn quote_asset(symbol: &str) -> Option<String> {
    split_symbol(symbol).map(|(_, quote)| quote)
}

fn non_empty_pair(base: &str, quote: &str) -> Option<(String, String)> {
    if base.is_empty() || quote.is_empty() || quote.contains('/') {
        return None;
    }
    Some((base.to_string(), quote.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_layouts() {
        assert_eq!(
            split_symbol("BTC/USDT"),
            Some(("BTC".to_string(), "USDT".to_string()))
        );
        assert_eq!(
            split_symbol("ethusdt"),
            Some(("ETH".to_string(), "USDT".to_string()))
        );
        assert_eq!(
            split_symbol("KRW-BTC"),
            Some(("BTC".to_string(), "KRW".to_string()))
        );
        assert_eq!(quote_asset("SOL-USDC").as_deref(), Some("USDC"));
    }

    #[test]
    fn dash_pairs_read_base_first_unless_upbit_style() {
        assert_eq!(
            split_symbol("BTC-USDT"),
            Some(("BTC".to_string(), "USDT".to_string()))
        );
        assert_eq!(
            split_symbol("eth-usdt"),
            Some(("ETH".to_string(), "USDT".to_string()))
        );
        assert_eq!(quote_asset("BNB-BTC").as_deref(), Some("BTC"));
        assert_eq!(quote_asset("BTC-KRW").as_deref(), Some("KRW"));
        assert_eq!(quote_asset("USDT-XRP").as_deref(), Some("USDT"));
        assert_eq!(
            split_symbol("KRW-ETH"),
            Some(("ETH".to_string(), "KRW".to_string()))
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(split_symbol("/USDT"), None);
        assert_eq!(split_symbol("USDT"), None);
        assert_eq!(split_symbol("FOO"), None);
    }
}
