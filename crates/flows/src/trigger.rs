//! Trigger matching — decides which flows engage an inbound message.

use std::collections::HashMap;

use chrono::{DateTime, Duration, FixedOffset, Offset, Utc};
use uuid::Uuid;

use chatflow_core::flow::{FlowDefinition, MatchMode};

/// Pure decision function over candidate flows. Holds only the tenant-local
/// clock offset used for time windows.
#[derive(Debug, Clone, Copy)]
pub struct TriggerMatcher {
    offset: FixedOffset,
}

impl Default for TriggerMatcher {
    fn default() -> Self {
        Self { offset: Utc.fix() }
    }
}

impl TriggerMatcher {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    /// Flows engaged by `text` at `now`, in input order. `last_engaged`
    /// holds the most recent engagement of each flow with this recipient.
    pub fn matching<'a>(
        &self,
        text: &str,
        flows: &'a [FlowDefinition],
        now: DateTime<Utc>,
        last_engaged: &HashMap<Uuid, DateTime<Utc>>,
    ) -> Vec<&'a FlowDefinition> {
        let local_time = now.with_timezone(&self.offset).time();
        flows
            .iter()
            .filter(|flow| flow.active)
            .filter(|flow| flow.window.contains(local_time))
            .filter(|flow| !cooling_down(flow, now, last_engaged.get(&flow.id)))
            .filter(|flow| triggers_match(flow, text))
            .collect()
    }
}

/// A cooldown too long to represent never runs out.
fn cooling_down(flow: &FlowDefinition, now: DateTime<Utc>, last: Option<&DateTime<Utc>>) -> bool {
    match last {
        Some(last) if flow.cooldown_secs > 0 => {
            match i64::try_from(flow.cooldown_secs)
                .ok()
                .and_then(Duration::try_seconds)
            {
                Some(cooldown) => now.signed_duration_since(*last) < cooldown,
                None => true,
            }
        }
        _ => false,
    }
}

fn triggers_match(flow: &FlowDefinition, text: &str) -> bool {
    flow.triggers.is_empty()
        || flow
            .triggers
            .iter()
            .any(|phrase| phrase_matches(flow.match_mode, phrase, text))
}

/// Whether one trigger phrase matches `text` under `mode`. INCLUDES modes
/// compare whole whitespace-separated tokens, so "cat" never matches
/// "concatenate".
pub fn phrase_matches(mode: MatchMode, phrase: &str, text: &str) -> bool {
    let fold = |s: &str| {
        if mode.ignores_case() {
            s.to_lowercase()
        } else {
            s.to_string()
        }
    };
    let phrase = fold(phrase.trim());
    let text = fold(text.trim());
    if phrase.is_empty() {
        return false;
    }

    match mode {
        MatchMode::ExactCase | MatchMode::ExactIgnoreCase => phrase == text,
        MatchMode::IncludesCase | MatchMode::IncludesIgnoreCase => {
            let needle: Vec<&str> = phrase.split_whitespace().collect();
            let haystack: Vec<&str> = text.split_whitespace().collect();
            haystack.windows(needle.len()).any(|w| w == needle.as_slice())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatflow_core::flow::{FlowNode, NodePayload, TimeWindow};
    use chatflow_core::types::Tenant;
    use chrono::{NaiveTime, TimeZone};

    fn flow(triggers: &[&str], mode: MatchMode) -> FlowDefinition {
        FlowDefinition {
            id: Uuid::new_v4(),
            tenant: Tenant::new("acct", "dev"),
            name: "welcome".into(),
            triggers: triggers.iter().map(|s| s.to_string()).collect(),
            match_mode: mode,
            active: true,
            window: TimeWindow {
                start: NaiveTime::from_hms_opt(0, 1, 0).unwrap(),
                end: NaiveTime::from_hms_opt(23, 59, 0).unwrap(),
            },
            cooldown_secs: 0,
            reply_context: false,
            nodes: vec![FlowNode {
                id: "start".into(),
                payload: NodePayload::Start,
                delay_secs: 0,
            }],
            edges: vec![],
            nurturing: vec![],
            forward: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_includes_respects_token_boundaries() {
        assert!(!phrase_matches(MatchMode::IncludesCase, "cat", "concatenate"));
        assert!(phrase_matches(MatchMode::IncludesCase, "cat", "my cat is hungry"));
        assert!(phrase_matches(MatchMode::IncludesIgnoreCase, "Order Status", "what is my order   status today"));
        assert!(!phrase_matches(MatchMode::IncludesIgnoreCase, "order status", "status of my order"));
        assert!(!phrase_matches(MatchMode::IncludesCase, "Cat", "my cat"));
    }

    #[test]
    fn test_exact_modes() {
        assert!(phrase_matches(MatchMode::ExactIgnoreCase, "hi", "  Hi "));
        assert!(!phrase_matches(MatchMode::ExactCase, "hi", "Hi"));
        assert!(!phrase_matches(MatchMode::ExactIgnoreCase, "hi", "hi there"));
        assert!(!phrase_matches(MatchMode::ExactCase, "   ", ""));
    }

    #[test]
    fn test_empty_triggers_catch_everything() {
        let flows = vec![flow(&[], MatchMode::ExactCase)];
        let matcher = TriggerMatcher::default();
        assert_eq!(matcher.matching("anything", &flows, noon(), &HashMap::new()).len(), 1);
    }

    #[test]
    fn test_inactive_and_out_of_window_flows_skipped() {
        let mut inactive = flow(&["hi"], MatchMode::ExactIgnoreCase);
        inactive.active = false;
        let mut night_only = flow(&["hi"], MatchMode::ExactIgnoreCase);
        night_only.window = TimeWindow {
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
        };
        let flows = vec![inactive, night_only];
        let matcher = TriggerMatcher::default();
        assert!(matcher.matching("hi", &flows, noon(), &HashMap::new()).is_empty());

        let late = Utc.with_ymd_and_hms(2026, 3, 2, 23, 30, 0).unwrap();
        let engaged = matcher.matching("hi", &flows, late, &HashMap::new());
        assert_eq!(engaged.len(), 1);
        assert_eq!(engaged[0].id, flows[1].id);
    }

    #[test]
    fn test_window_uses_local_offset() {
        let mut morning = flow(&[], MatchMode::ExactCase);
        morning.window = TimeWindow {
            start: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
        };
        let flows = vec![morning];
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 11, 0, 0).unwrap();
        assert!(TriggerMatcher::default().matching("x", &flows, at, &HashMap::new()).is_empty());
        let minus_two = TriggerMatcher::new(FixedOffset::west_opt(2 * 3600).unwrap());
        assert_eq!(minus_two.matching("x", &flows, at, &HashMap::new()).len(), 1);
    }

    #[test]
    fn test_cooldown_blocks_second_hi() {
        let mut greet = flow(&["hi"], MatchMode::ExactIgnoreCase);
        greet.cooldown_secs = 60;
        let flows = vec![greet];
        let matcher = TriggerMatcher::default();

        let first = noon();
        let mut history = HashMap::new();
        assert_eq!(matcher.matching("Hi", &flows, first, &history).len(), 1);
        history.insert(flows[0].id, first);

        let second = first + Duration::seconds(10);
        assert!(matcher.matching("Hi", &flows, second, &history).is_empty());
        let later = first + Duration::seconds(60);
        assert_eq!(matcher.matching("Hi", &flows, later, &history).len(), 1);
    }

    #[test]
    fn test_huge_cooldown_never_expires() {
        let mut forever = flow(&["hi"], MatchMode::ExactIgnoreCase);
        forever.cooldown_secs = u64::MAX;
        let mut long = flow(&["hi"], MatchMode::ExactIgnoreCase);
        long.cooldown_secs = i64::MAX as u64;
        let flows = vec![forever, long];
        let matcher = TriggerMatcher::default();

        let mut history = HashMap::new();
        assert_eq!(matcher.matching("hi", &flows, noon(), &history).len(), 2);
        for f in &flows {
            history.insert(f.id, noon());
        }
        let years_later = noon() + Duration::days(365 * 50);
        assert!(matcher.matching("hi", &flows, years_later, &history).is_empty());
    }

    #[test]
    fn test_preserves_input_order() {
        let flows = vec![
            flow(&["menu"], MatchMode::IncludesIgnoreCase),
            flow(&[], MatchMode::ExactCase),
            flow(&["price"], MatchMode::IncludesIgnoreCase),
        ];
        let engaged = TriggerMatcher::default().matching("Menu please", &flows, noon(), &HashMap::new());
        let ids: Vec<Uuid> = engaged.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![flows[0].id, flows[1].id]);
    }
}
