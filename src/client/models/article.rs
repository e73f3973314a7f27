use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Article metadata as listed by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: i64,
    pub title: String,
    pub author: String,
    /// Publication date as served; either RFC 3339 or a bare `YYYY-MM-DD`.
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub summary: String,
    pub points: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArticleTag {
    Risk(RiskLevel),
    Product(String),
    Official,
    Recent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub risk: RiskLevel,
    pub tags: Vec<ArticleTag>,
}

/// An article costing at least this many points is displayed as high risk.
const HIGH_RISK_POINTS: i64 = 15;
const MEDIUM_RISK_POINTS: i64 = 5;
const RECENT_WINDOW_DAYS: i64 = 3;
const OFFICIAL_AUTHOR: &str = "official";
const PRODUCT_KEYWORDS: &[&str] = &["confluence"];

/// Display classification derived from point cost and metadata.
///
/// Stateless and side-effect-free so every list view applies the same rule.
pub fn classify(article: &Article) -> Classification {
    classify_at(article, Utc::now())
}

pub fn classify_at(article: &Article, now: DateTime<Utc>) -> Classification {
    let risk = if article.points >= HIGH_RISK_POINTS {
        RiskLevel::High
    } else if article.points >= MEDIUM_RISK_POINTS {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };

    let mut tags = vec![ArticleTag::Risk(risk)];

    let title = article.title.to_lowercase();
    for product in PRODUCT_KEYWORDS {
        if title.contains(product) {
            tags.push(ArticleTag::Product((*product).to_string()));
        }
    }
    if article.author == OFFICIAL_AUTHOR {
        tags.push(ArticleTag::Official);
    }
    if let Some(published) = parse_article_date(&article.date) {
        if now.signed_duration_since(published) <= Duration::days(RECENT_WINDOW_DAYS) {
            tags.push(ArticleTag::Recent);
        }
    }

    Classification { risk, tags }
}

fn parse_article_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}
