// =============================================================================
// Bundled Detection Methods
// =============================================================================
//
// Four independent heuristics, each a pure function of the detection context:
//
//   1. volatility_spike         — `volatility` above a threshold
//                                 -> VOLATILITY_SHOCK
//   2. trend_reversal           — 50/200 moving-average cross confirmed by
//                                 price -> BULL_MARKET / BEAR_MARKET
//   3. news_sentiment_shift     — keyword buckets over recent NEWS events
//                                 -> GEOPOLITICAL_CRISIS / BEAR / BULL
//   4. economic_indicator_shift — threshold rules over macro readings
//                                 -> RECESSION, INFLATION, DEFLATION,
//                                    MONETARY_TIGHTENING / EASING, EXPANSION
//
// None of them is privileged: the detector treats them like any other
// registered method and any can be replaced or unregistered.
// =============================================================================

use std::sync::Arc;

use tracing::trace;

use crate::event_hub::{Event, EventType};
use crate::regime::detector::{DetectionContext, RegimeDetector};
use crate::regime::types::{Regime, RegimeCandidate};
use crate::runtime_config::StrategyParams;

pub const VOLATILITY_SPIKE: &str = "volatility_spike";
pub const TREND_REVERSAL: &str = "trend_reversal";
pub const NEWS_SENTIMENT_SHIFT: &str = "news_sentiment_shift";
pub const ECONOMIC_INDICATOR_SHIFT: &str = "economic_indicator_shift";

/// Supporting events attached by the market-data driven methods.
const MAX_EVIDENCE: usize = 10;

const POSITIVE_KEYWORDS: &[&str] = &[
    "rally", "surge", "growth", "record high", "optimism", "recovery", "beat", "upgrade", "boom",
];

const NEGATIVE_KEYWORDS: &[&str] = &[
    "crash", "selloff", "sell-off", "plunge", "recession", "downturn", "layoffs", "default",
    "downgrade", "slump", "bankruptcy",
];

const CRISIS_KEYWORDS: &[&str] = &[
    "war", "invasion", "sanctions", "conflict", "coup", "terror", "blockade", "missile",
];

/// Register all four bundled methods on `detector`, in the order listed above.
pub fn install_default_methods(detector: &RegimeDetector, params: &StrategyParams) {
    let p = params.clone();
    detector.register_detection_method(VOLATILITY_SPIKE, move |ctx: &DetectionContext<'_>| {
        Ok(volatility_spike(ctx, &p))
    });
    detector.register_detection_method(TREND_REVERSAL, |ctx: &DetectionContext<'_>| {
        Ok(trend_reversal(ctx))
    });
    let p = params.clone();
    detector.register_detection_method(NEWS_SENTIMENT_SHIFT, move |ctx: &DetectionContext<'_>| {
        Ok(news_sentiment_shift(ctx, &p))
    });
    detector.register_detection_method(ECONOMIC_INDICATOR_SHIFT, |ctx: &DetectionContext<'_>| {
        Ok(economic_indicator_shift(ctx))
    });
}

// =============================================================================
// 1. Volatility spike
// =============================================================================

pub fn volatility_spike(ctx: &DetectionContext<'_>, params: &StrategyParams) -> Option<RegimeCandidate> {
    let volatility = ctx.market("volatility")?;
    let threshold = params.volatility_threshold;
    if volatility <= threshold {
        return None;
    }

    let excess = (volatility - threshold) / threshold;
    let confidence = (0.7 + excess).min(0.95);

    Some(
        RegimeCandidate::new(Regime::VolatilityShock, confidence)
            .with_evidence(ctx.latest_of(EventType::MarketMovement, MAX_EVIDENCE))
            .with_indicator("volatility", volatility)
            .with_indicator("volatility_threshold", threshold),
    )
}

// =============================================================================
// 2. Trend reversal (moving-average cross)
// =============================================================================

pub fn trend_reversal(ctx: &DetectionContext<'_>) -> Option<RegimeCandidate> {
    let price = ctx.market("price")?;
    let sma50 = ctx.market("sma50")?;
    let sma200 = ctx.market("sma200")?;
    if sma200 <= 0.0 {
        return None;
    }

    let spread = (sma50 - sma200) / sma200;
    let regime = if spread > 0.0 && price > sma50 {
        Regime::BullMarket
    } else if spread < 0.0 && price < sma50 {
        Regime::BearMarket
    } else {
        trace!(price, sma50, sma200, "trend reversal: no confirmed cross");
        return None;
    };

    let confidence = remap(spread.abs(), 0.0, 0.05, 0.6, 0.9);
    Some(
        RegimeCandidate::new(regime, confidence)
            .with_evidence(ctx.latest_of(EventType::MarketMovement, MAX_EVIDENCE))
            .with_indicator("price", price)
            .with_indicator("sma50", sma50)
            .with_indicator("sma200", sma200)
            .with_indicator("ma_spread", spread),
    )
}

// =============================================================================
// 3. News sentiment shift
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tone {
    Positive,
    Negative,
    Neutral,
}

/// Whole-word (or whole-phrase) keyword matches in `padded`, which must be
/// normalised by [`normalise`].
fn keyword_hits(padded: &str, keywords: &[&str]) -> usize {
    keywords
        .iter()
        .filter(|k| padded.contains(&format!(" {k} ")))
        .count()
}

/// Lowercase, strip punctuation and pad with spaces so keywords only match
/// whole words ("war" must not match "software").
fn normalise(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect();
    let words: Vec<&str> = cleaned.split_whitespace().collect();
    format!(" {} ", words.join(" "))
}

fn score_article(event: &Event) -> (Tone, bool) {
    let text = normalise(&event.content);
    let positive = keyword_hits(&text, POSITIVE_KEYWORDS);
    let negative = keyword_hits(&text, NEGATIVE_KEYWORDS);
    let crisis = keyword_hits(&text, CRISIS_KEYWORDS) > 0;

    let tone = match positive.cmp(&negative) {
        std::cmp::Ordering::Greater => Tone::Positive,
        std::cmp::Ordering::Less => Tone::Negative,
        std::cmp::Ordering::Equal => Tone::Neutral,
    };
    (tone, crisis)
}

pub fn news_sentiment_shift(ctx: &DetectionContext<'_>, params: &StrategyParams) -> Option<RegimeCandidate> {
    let articles = ctx.latest_of(EventType::News, params.news_window);
    if articles.len() < params.news_min_events.max(1) {
        return None;
    }

    let scored: Vec<(Arc<Event>, Tone, bool)> = articles
        .into_iter()
        .map(|e| {
            let (tone, crisis) = score_article(&e);
            (e, tone, crisis)
        })
        .collect();

    let total = scored.len() as f64;
    let positive = scored.iter().filter(|(_, t, _)| *t == Tone::Positive).count() as f64;
    let negative = scored.iter().filter(|(_, t, _)| *t == Tone::Negative).count() as f64;
    let crisis = scored.iter().filter(|(_, _, c)| *c).count() as f64;

    let net = (positive - negative) / total;
    let crisis_share = crisis / total;

    let (regime, confidence, evidence): (Regime, f64, Vec<Arc<Event>>) =
        if crisis_share >= params.crisis_share {
            (
                Regime::GeopoliticalCrisis,
                remap(crisis_share, params.crisis_share, 1.0, 0.7, 0.95),
                pick(&scored, |_, c| c),
            )
        } else if net <= -params.sentiment_threshold {
            (
                Regime::BearMarket,
                remap(-net, params.sentiment_threshold, 1.0, 0.6, 0.9),
                pick(&scored, |t, _| t == Tone::Negative),
            )
        } else if net >= params.sentiment_threshold {
            (
                Regime::BullMarket,
                remap(net, params.sentiment_threshold, 1.0, 0.6, 0.9),
                pick(&scored, |t, _| t == Tone::Positive),
            )
        } else {
            trace!(net, crisis_share, "news sentiment: no shift");
            return None;
        };

    Some(
        RegimeCandidate::new(regime, confidence)
            .with_evidence(evidence)
            .with_indicator("news_sentiment", net)
            .with_indicator("crisis_share", crisis_share)
            .with_indicator("news_articles", total),
    )
}

fn pick(scored: &[(Arc<Event>, Tone, bool)], keep: impl Fn(Tone, bool) -> bool) -> Vec<Arc<Event>> {
    scored
        .iter()
        .filter(|(_, t, c)| keep(*t, *c))
        .map(|(e, _, _)| Arc::clone(e))
        .collect()
}

// =============================================================================
// 4. Economic indicator shift
// =============================================================================

pub fn economic_indicator_shift(ctx: &DetectionContext<'_>) -> Option<RegimeCandidate> {
    let gdp = ctx.market("gdpGrowth");
    let unemployment = ctx.market("unemployment");
    let inflation = ctx.market("inflation");
    let rates = ctx.market("interestRates");

    // Rule order doubles as the tie-break: first rule wins equal confidence.
    let mut rules: Vec<(Regime, f64)> = Vec::new();

    if let (Some(g), Some(u)) = (gdp, unemployment) {
        if g < 0.0 && u > 6.0 {
            rules.push((Regime::Recession, remap(-g, 0.0, 3.0, 0.7, 0.95)));
        }
    }
    if let Some(i) = inflation {
        if i > 4.0 {
            rules.push((Regime::Inflation, remap(i, 4.0, 10.0, 0.65, 0.95)));
        } else if i < 0.0 {
            rules.push((Regime::Deflation, remap(-i, 0.0, 3.0, 0.65, 0.9)));
        }
    }
    if let (Some(r), Some(i)) = (rates, inflation) {
        if r > 5.0 && i > 3.0 {
            rules.push((Regime::MonetaryTightening, remap(r, 5.0, 10.0, 0.6, 0.9)));
        }
    }
    if let Some(r) = rates {
        if r < 1.0 {
            rules.push((Regime::MonetaryEasing, remap(r, 1.0, 0.0, 0.6, 0.85)));
        }
    }
    if let (Some(g), Some(u)) = (gdp, unemployment) {
        if g > 2.5 && u < 5.0 {
            rules.push((Regime::Expansion, remap(g, 2.5, 6.0, 0.6, 0.85)));
        }
    }

    let (regime, confidence) = rules
        .into_iter()
        .fold(None, |best: Option<(Regime, f64)>, rule| match best {
            Some(b) if b.1 >= rule.1 => Some(b),
            _ => Some(rule),
        })?;

    let mut candidate = RegimeCandidate::new(regime, confidence)
        .with_evidence(ctx.latest_of(EventType::EconomicIndicator, MAX_EVIDENCE));
    for (name, value) in [
        ("gdpGrowth", gdp),
        ("unemployment", unemployment),
        ("inflation", inflation),
        ("interestRates", rates),
    ] {
        if let Some(v) = value {
            candidate = candidate.with_indicator(name, v);
        }
    }
    Some(candidate)
}

/// Linearly remap `value` from `[in_lo, in_hi]` to `[out_lo, out_hi]`, clamped
/// to the output range. Works regardless of whether `in_lo < in_hi` or vice
/// versa.
fn remap(value: f64, in_lo: f64, in_hi: f64, out_lo: f64, out_hi: f64) -> f64 {
    let t = if (in_hi - in_lo).abs() < f64::EPSILON {
        0.5
    } else {
        (value - in_lo) / (in_hi - in_lo)
    };
    let clamped = t.clamp(0.0, 1.0);
    out_lo + clamped * (out_hi - out_lo)
}
