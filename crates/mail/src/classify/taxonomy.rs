//! The tag taxonomy the classifier is allowed to emit

use std::collections::HashSet;

use config::{AiConfig, TagSpec};

/// Built-in default taxonomy
///
/// Kept deliberately broad; accounts narrow it with `excludeTags` and
/// extend it with `tags`.
fn default_entries() -> Vec<TagSpec> {
    fn spec(name: &str, description: &str) -> TagSpec {
        TagSpec {
            name: name.to_string(),
            description: description.to_string(),
        }
    }

    vec![
        spec("work", "Job-related correspondence with colleagues or clients"),
        spec("personal", "Mail from friends and family written by a person"),
        spec("family", "Mail concerning family members or household matters"),
        spec("finance", "Banking, payments, statements, and money matters"),
        spec("invoice", "Bills and invoices requesting payment"),
        spec("receipts", "Purchase confirmations and payment receipts"),
        spec("taxes", "Tax filings, assessments, and related paperwork"),
        spec("banking", "Messages from banks and credit unions"),
        spec("investing", "Brokerage statements and market updates"),
        spec("shopping", "Order updates and storefront mail"),
        spec("shipping", "Parcel tracking and delivery notifications"),
        spec("travel", "Itineraries, bookings, and travel documents"),
        spec("flights", "Airline confirmations and flight status"),
        spec("lodging", "Hotel and rental reservations"),
        spec("events", "Invitations and event announcements"),
        spec("calendar", "Meeting invitations and schedule changes"),
        spec("meetings", "Agendas, minutes, and meeting follow-ups"),
        spec("dev", "Code review, repository, and build tooling mail"),
        spec("ci", "Continuous integration results and pipeline alerts"),
        spec("security", "Security advisories, sign-in alerts, and 2FA codes"),
        spec("alerts", "Automated monitoring and status alerts"),
        spec("newsletters", "Periodic newsletters and digests"),
        spec("news", "News publications and press updates"),
        spec("social", "Social network notifications"),
        spec("promotions", "Sales, discounts, and promotional offers"),
        spec("marketing", "Vendor marketing and product announcements"),
        spec("health", "Medical appointments, results, and health services"),
        spec("insurance", "Policies, claims, and coverage notices"),
        spec("legal", "Contracts, legal notices, and official documents"),
        spec("education", "Courses, schools, and learning platforms"),
        spec("jobs", "Recruiting, applications, and career mail"),
        spec("support", "Customer support tickets and replies"),
        spec("utilities", "Utility bills and service notifications"),
        spec("subscriptions", "Subscription renewals and account notices"),
        spec("spam-suspect", "Unsolicited mail that slipped past filters"),
    ]
}

/// The closed tag set the classifier may emit, with descriptions for
/// the prompt
#[derive(Debug, Clone)]
pub struct Taxonomy {
    entries: Vec<TagSpec>,
    names: HashSet<String>,
}

impl Taxonomy {
    /// Assemble from configuration: defaults (unless disabled), minus
    /// exclusions, plus configured extras
    pub fn from_config(ai: &AiConfig) -> Self {
        let mut entries: Vec<TagSpec> = Vec::new();
        if ai.use_default_tags {
            let excluded: HashSet<&str> = ai.exclude_tags.iter().map(|s| s.as_str()).collect();
            entries.extend(
                default_entries()
                    .into_iter()
                    .filter(|e| !excluded.contains(e.name.as_str())),
            );
        }
        for extra in &ai.tags {
            if !entries.iter().any(|e| e.name == extra.name) {
                entries.push(extra.clone());
            }
        }
        let names = entries.iter().map(|e| e.name.clone()).collect();
        Self { entries, names }
    }

    pub fn entries(&self) -> &[TagSpec] {
        &self.entries
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.names.contains(tag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_taxonomy_has_35_entries() {
        assert_eq!(default_entries().len(), 35);
    }

    #[test]
    fn test_from_config_defaults() {
        let taxonomy = Taxonomy::from_config(&AiConfig::default());
        assert_eq!(taxonomy.len(), 35);
        assert!(taxonomy.contains("finance"));
        assert!(!taxonomy.contains("beekeeping"));
    }

    #[test]
    fn test_exclusions_and_extras() {
        let mut ai = AiConfig::default();
        ai.exclude_tags = vec!["social".to_string(), "news".to_string()];
        ai.tags = vec![TagSpec {
            name: "beekeeping".to_string(),
            description: "Apiary correspondence".to_string(),
        }];
        let taxonomy = Taxonomy::from_config(&ai);
        assert_eq!(taxonomy.len(), 34);
        assert!(!taxonomy.contains("social"));
        assert!(taxonomy.contains("beekeeping"));
    }

    #[test]
    fn test_defaults_disabled() {
        let mut ai = AiConfig::default();
        ai.use_default_tags = false;
        ai.tags = vec![TagSpec {
            name: "only".to_string(),
            description: "The only tag".to_string(),
        }];
        let taxonomy = Taxonomy::from_config(&ai);
        assert_eq!(taxonomy.len(), 1);
    }
}
