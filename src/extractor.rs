use crate::models::RawListing;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

/// A page-layout variant. Each strategy is a pure function from parsed
/// markup to raw listings; `detect` picks one by page shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Strategy {
    /// The regular search-results layout: `article.aditem` cards.
    AditemCards,
    /// Plain `<article>` elements, for layout drift.
    ArticleFallback,
}

impl Strategy {
    pub fn name(&self) -> &str {
        match self {
            Strategy::AditemCards => "aditem_cards",
            Strategy::ArticleFallback => "article_fallback",
        }
    }
}

/// Picks the extraction strategy for a parsed document.
pub fn detect(document: &Html) -> Strategy {
    if let Ok(selector) = Selector::parse("article.aditem") {
        if document.select(&selector).next().is_some() {
            return Strategy::AditemCards;
        }
    }
    Strategy::ArticleFallback
}

/// Parses one fetched page into raw listings. Zero results is a valid
/// outcome (last page reached, or a layout we cannot read).
pub fn extract(raw_content: &str, base_url: &str) -> Vec<RawListing> {
    let document = Html::parse_document(raw_content);
    let strategy = detect(&document);
    tracing::debug!(strategy = strategy.name(), "extracting listings");

    let listings = match strategy {
        Strategy::AditemCards => extract_aditem_cards(&document, base_url),
        Strategy::ArticleFallback => extract_article_fallback(&document, base_url),
    };

    tracing::debug!(count = listings.len(), "extracted listings");
    listings
}

fn extract_aditem_cards(document: &Html, base_url: &str) -> Vec<RawListing> {
    let Ok(card_selector) = Selector::parse("article.aditem") else {
        return Vec::new();
    };

    document
        .select(&card_selector)
        .filter_map(|card| {
            if is_wanted_ad(&card) {
                tracing::trace!("skipping wanted ad");
                return None;
            }

            let title = select_text(&card, "h2");
            let url = build_full_url(base_url, &select_href(&card));
            // A card without a title or detail link is navigation chrome,
            // not a listing.
            if title.is_empty() || url.is_empty() {
                return None;
            }

            Some(RawListing {
                title,
                price_text: select_text(&card, "div.aditem-main--middle--price-shipping p"),
                location_text: select_text(&card, "div.aditem-main--top--left"),
                url,
            })
        })
        .collect()
}

fn extract_article_fallback(document: &Html, base_url: &str) -> Vec<RawListing> {
    let Ok(article_selector) = Selector::parse("article") else {
        return Vec::new();
    };

    document
        .select(&article_selector)
        .filter_map(|article| {
            if is_wanted_ad(&article) {
                return None;
            }

            let mut title = select_text(&article, "h2");
            if title.is_empty() {
                title = select_text(&article, "h3");
            }
            let url = build_full_url(base_url, &select_href(&article));
            if title.is_empty() || url.is_empty() {
                return None;
            }

            Some(RawListing {
                title,
                price_text: select_text(&article, "[class*='price']"),
                location_text: select_text(&article, "[class*='top--left']"),
                url,
            })
        })
        .collect()
}

/// Wanted ads ("Gesuch") are requests to buy, not offers.
fn is_wanted_ad(element: &ElementRef) -> bool {
    Selector::parse("span.simpletag")
        .ok()
        .map(|sel| {
            element
                .select(&sel)
                .any(|tag| tag.text().collect::<String>().contains("Gesuch"))
        })
        .unwrap_or(false)
}

fn select_text(element: &ElementRef, selector: &str) -> String {
    Selector::parse(selector)
        .ok()
        .and_then(|sel| element.select(&sel).next())
        .map(|el| el.text().collect::<String>().trim().to_string())
        .unwrap_or_default()
}

fn select_href(element: &ElementRef) -> String {
    Selector::parse("a[href]")
        .ok()
        .and_then(|sel| element.select(&sel).next())
        .and_then(|el| el.value().attr("href"))
        .unwrap_or("")
        .to_string()
}

fn build_full_url(base_url: &str, href: &str) -> String {
    if href.starts_with("http") {
        href.to_string()
    } else if href.starts_with('/') {
        format!("{}{}", base_url.trim_end_matches('/'), href)
    } else {
        String::new()
    }
}

/// Normalizes price text like "1.200 € VB" or "ab 45 €" to a numeric
/// value. Ambiguous text yields `None`, never a guess; "Zu verschenken"
/// (give away) is zero.
pub fn parse_price(price_text: &str) -> Option<f64> {
    let trimmed = price_text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.to_lowercase().contains("verschenken") {
        return Some(0.0);
    }

    // Take the first numeric token before the currency sign. "VB", "ab"
    // and shipping text fall away with it.
    let before_currency = trimmed.split('€').next().unwrap_or("");
    let number = Regex::new(r"[0-9][0-9.,]*").ok()?;
    let matched = number.find(before_currency)?;
    let cleaned = matched.as_str().replace('.', "").replace(',', ".");
    cleaned.parse::<f64>().ok()
}

/// Splits location text of the form "12345 City Name" into postal code
/// and city. A leading token that is not all digits leaves the postal
/// code empty; a single malformed token leaves both fields empty.
pub fn split_location(location_text: &str) -> (String, String) {
    let trimmed = location_text.trim();
    if trimmed.is_empty() {
        return (String::new(), String::new());
    }

    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim();

    let postal_code = if !first.is_empty() && first.chars().all(|c| c.is_ascii_digit()) {
        first.to_string()
    } else {
        String::new()
    };

    (postal_code, rest.to_string())
}

/// Derives the stable identity from a detail URL: its last path segment,
/// stripped of query and fragment.
pub fn identity_from_url(url: &str) -> String {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let without_query = without_fragment.split('?').next().unwrap_or(without_fragment);

    without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty() && !segment.contains(':'))
        .unwrap_or(without_query)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEARCH_PAGE: &str = r#"
        <html><body>
        <ul id="srchrslt-adtable">
            <article class="aditem" data-adid="2345678901">
                <div class="aditem-main--top--left">10115 Berlin</div>
                <h2><a href="/s-anzeige/herrenrad-28-zoll/2345678901-217-3331">Herrenrad 28 Zoll</a></h2>
                <div class="aditem-main--middle--price-shipping">
                    <p class="aditem-main--middle--price-shipping--price">120 € VB</p>
                </div>
            </article>
            <article class="aditem" data-adid="2345678902">
                <div class="aditem-main--top--left">80331 München</div>
                <h2><a href="/s-anzeige/kinderfahrrad/2345678902-217-6176">Kinderfahrrad</a></h2>
                <div class="aditem-main--middle--price-shipping">
                    <p>Zu verschenken</p>
                </div>
            </article>
            <article class="aditem" data-adid="2345678903">
                <div class="aditem-main--top--left">50667 Köln</div>
                <h2><a href="/s-anzeige/suche-rennrad/2345678903-217-1234">Suche Rennrad</a></h2>
                <span class="simpletag">Gesuch</span>
            </article>
        </ul>
        </body></html>
    "#;

    #[test]
    fn detects_aditem_layout() {
        let document = Html::parse_document(SEARCH_PAGE);
        assert_eq!(detect(&document), Strategy::AditemCards);
    }

    #[test]
    fn detects_fallback_for_unknown_layout() {
        let document = Html::parse_document("<html><body><article><h2>x</h2></article></body></html>");
        assert_eq!(detect(&document), Strategy::ArticleFallback);
    }

    #[test]
    fn extracts_cards_and_skips_wanted_ads() {
        let listings = extract(SEARCH_PAGE, "https://www.kleinanzeigen.de");
        assert_eq!(listings.len(), 2, "the Gesuch card must be skipped");

        assert_eq!(listings[0].title, "Herrenrad 28 Zoll");
        assert_eq!(listings[0].price_text, "120 € VB");
        assert_eq!(listings[0].location_text, "10115 Berlin");
        assert_eq!(
            listings[0].url,
            "https://www.kleinanzeigen.de/s-anzeige/herrenrad-28-zoll/2345678901-217-3331"
        );

        assert_eq!(listings[1].title, "Kinderfahrrad");
        assert_eq!(listings[1].price_text, "Zu verschenken");
    }

    #[test]
    fn card_without_title_or_link_is_skipped() {
        let html = r#"
            <article class="aditem">
                <div class="aditem-main--middle--price-shipping"><p>50 €</p></div>
            </article>
        "#;
        let listings = extract(html, "https://www.kleinanzeigen.de");
        assert!(listings.is_empty());
    }

    #[test]
    fn empty_page_yields_no_listings() {
        let listings = extract("<html><body></body></html>", "https://www.kleinanzeigen.de");
        assert!(listings.is_empty());
    }

    #[test]
    fn fallback_strategy_reads_plain_articles() {
        let html = r#"
            <article>
                <h2>Damenrad gebraucht</h2>
                <span class="ad-price">75 €</span>
                <a href="/s-anzeige/damenrad/111-217-1"></a>
            </article>
        "#;
        let listings = extract(html, "https://www.kleinanzeigen.de");
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].title, "Damenrad gebraucht");
        assert_eq!(listings[0].price_text, "75 €");
    }

    #[test]
    fn missing_price_element_yields_empty_price_text() {
        let html = r#"
            <article class="aditem">
                <h2><a href="/s-anzeige/ohne-preis/222-217-2">Ohne Preis</a></h2>
            </article>
        "#;
        let listings = extract(html, "https://www.kleinanzeigen.de");
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].price_text, "");
    }

    #[test]
    fn parse_price_standard_format() {
        assert_eq!(parse_price("120 €"), Some(120.0));
    }

    #[test]
    fn parse_price_with_thousands_separator() {
        assert_eq!(parse_price("1.200 €"), Some(1200.0));
    }

    #[test]
    fn parse_price_with_decimal_comma() {
        assert_eq!(parse_price("89,50 €"), Some(89.5));
    }

    #[test]
    fn parse_price_strips_vb_suffix() {
        assert_eq!(parse_price("120 € VB"), Some(120.0));
    }

    #[test]
    fn parse_price_strips_ab_prefix() {
        assert_eq!(parse_price("ab 45 €"), Some(45.0));
    }

    #[test]
    fn parse_price_with_non_breaking_space() {
        assert_eq!(parse_price("1.250\u{00a0}€"), Some(1250.0));
    }

    #[test]
    fn parse_price_give_away_is_zero() {
        assert_eq!(parse_price("Zu verschenken"), Some(0.0));
    }

    #[test]
    fn parse_price_bare_vb_is_absent() {
        assert_eq!(parse_price("VB"), None);
    }

    #[test]
    fn parse_price_empty_is_absent() {
        assert_eq!(parse_price(""), None);
        assert_eq!(parse_price("   "), None);
    }

    #[test]
    fn parse_price_garbage_is_absent() {
        assert_eq!(parse_price("auf Anfrage"), None);
    }

    #[test]
    fn split_location_normal_case() {
        assert_eq!(
            split_location("10115 Berlin"),
            ("10115".to_string(), "Berlin".to_string())
        );
    }

    #[test]
    fn split_location_multi_word_city() {
        assert_eq!(
            split_location("60311 Frankfurt am Main"),
            ("60311".to_string(), "Frankfurt am Main".to_string())
        );
    }

    #[test]
    fn split_location_without_postal_code() {
        assert_eq!(
            split_location("Bei München"),
            ("".to_string(), "München".to_string())
        );
    }

    #[test]
    fn split_location_single_malformed_token_is_empty() {
        assert_eq!(
            split_location("not-a-real-place"),
            ("".to_string(), "".to_string())
        );
    }

    #[test]
    fn split_location_postal_code_only() {
        assert_eq!(
            split_location("10115"),
            ("10115".to_string(), "".to_string())
        );
    }

    #[test]
    fn split_location_empty() {
        assert_eq!(split_location("  "), ("".to_string(), "".to_string()));
    }

    #[test]
    fn identity_is_last_path_segment() {
        assert_eq!(
            identity_from_url(
                "https://www.kleinanzeigen.de/s-anzeige/herrenrad/2345678901-217-3331"
            ),
            "2345678901-217-3331"
        );
    }

    #[test]
    fn identity_ignores_query_and_fragment() {
        assert_eq!(
            identity_from_url("https://example.org/s-anzeige/rad/999-1-2?utm=x#top"),
            "999-1-2"
        );
    }

    #[test]
    fn identity_ignores_trailing_slash() {
        assert_eq!(identity_from_url("https://example.org/anzeige/42-1-1/"), "42-1-1");
    }

    #[test]
    fn identity_is_stable_for_equal_urls() {
        let url = "https://www.kleinanzeigen.de/s-anzeige/rad/123-217-1";
        assert_eq!(identity_from_url(url), identity_from_url(url));
    }
}
