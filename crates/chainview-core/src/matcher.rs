//! Source matcher — selects the (transaction, events) pairs a view cares about.
//!
//! Pure: no I/O, no state. The block processor feeds it every transaction and
//! event at one height.

use std::collections::{HashMap, HashSet};

use regex::Regex;

use crate::definition::Source;
use crate::types::{ChainEvent, Transaction};

/// A transaction selected by one source, with the events that qualified.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedTx {
    pub tx: Transaction,
    /// Empty for a pure transaction-level match.
    pub events: Vec<ChainEvent>,
    pub source_key: String,
}

/// A compiled glob: `*` is the only wildcard.
#[derive(Debug, Clone)]
pub enum Glob {
    Exact(String),
    Pattern(Regex),
}

impl Glob {
    pub fn new(pattern: &str) -> Self {
        if !pattern.contains('*') {
            return Self::Exact(pattern.to_string());
        }
        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        match Regex::new(&format!("^{body}$")) {
            Ok(re) => Self::Pattern(re),
            // Escaped input always compiles; fall back to exact equality regardless.
            Err(_) => Self::Exact(pattern.to_string()),
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::Exact(s) => s == value,
            Self::Pattern(re) => re.is_match(value),
        }
    }

    fn matches_opt(&self, value: Option<&str>) -> bool {
        value.is_some_and(|v| self.matches(v))
    }
}

/// Match `sources` against one block's transactions and events.
///
/// Results follow source declaration order, then transaction order, and hold
/// at most one entry per `(tx_id, source_key)`.
pub fn match_sources(
    sources: &[Source],
    transactions: &[Transaction],
    events: &[ChainEvent],
) -> Vec<MatchedTx> {
    let mut by_tx: HashMap<&str, Vec<&ChainEvent>> = HashMap::new();
    for event in events {
        by_tx.entry(event.tx_id.as_str()).or_default().push(event);
    }
    for list in by_tx.values_mut() {
        list.sort_by_key(|e| e.event_index);
    }

    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut out = Vec::new();

    for source in sources {
        let key = source.key();
        let matcher = SourceMatcher::new(source);
        for tx in transactions {
            let tx_events = by_tx.get(tx.tx_id.as_str()).map(Vec::as_slice).unwrap_or(&[]);
            let Some(events) = matcher.match_tx(tx, tx_events) else {
                continue;
            };
            if !seen.insert((tx.tx_id.clone(), key.clone())) {
                continue;
            }
            out.push(MatchedTx {
                tx: tx.clone(),
                events,
                source_key: key.clone(),
            });
        }
    }
    out
}

/// A source with its globs compiled once per block.
enum SourceMatcher {
    Contract {
        contract: Glob,
        function: Option<Glob>,
        event: Option<Glob>,
    },
    TransactionType {
        tx_type: Glob,
        min_amount: Option<u64>,
    },
}

impl SourceMatcher {
    fn new(source: &Source) -> Self {
        match source {
            Source::Contract {
                contract,
                function,
                event,
            } => Self::Contract {
                contract: Glob::new(contract),
                function: function.as_deref().map(Glob::new),
                event: event.as_deref().map(Glob::new),
            },
            Source::TransactionType {
                tx_type,
                min_amount,
            } => Self::TransactionType {
                tx_type: Glob::new(tx_type),
                min_amount: *min_amount,
            },
        }
    }

    /// `Some(events)` when the transaction matches, `None` otherwise.
    fn match_tx(&self, tx: &Transaction, tx_events: &[&ChainEvent]) -> Option<Vec<ChainEvent>> {
        match self {
            Self::TransactionType {
                tx_type,
                min_amount,
            } => {
                if !tx_type.matches(&tx.tx_type) {
                    return None;
                }
                match min_amount {
                    None => Some(tx_events.iter().map(|e| (*e).clone()).collect()),
                    Some(min) => {
                        let qualifying: Vec<ChainEvent> = tx_events
                            .iter()
                            .filter(|e| {
                                e.data
                                    .amount_field("amount")
                                    .is_some_and(|a| a >= u128::from(*min))
                            })
                            .map(|e| (*e).clone())
                            .collect();
                        (!qualifying.is_empty()).then_some(qualifying)
                    }
                }
            }
            Self::Contract {
                contract,
                function,
                event,
            } => {
                let direct = contract.matches_opt(tx.contract_id.as_deref());
                let candidates: Vec<&ChainEvent> = if direct {
                    tx_events.to_vec()
                } else {
                    tx_events
                        .iter()
                        .copied()
                        .filter(|e| contract.matches_opt(e.data.str_field("contract_identifier")))
                        .collect()
                };
                if !direct && candidates.is_empty() {
                    return None;
                }
                if let Some(function) = function {
                    if !function.matches_opt(tx.function_name.as_deref()) {
                        return None;
                    }
                }
                let events: Vec<ChainEvent> = match event {
                    None => candidates.into_iter().cloned().collect(),
                    Some(event) => {
                        let narrowed: Vec<ChainEvent> = candidates
                            .into_iter()
                            .filter(|e| {
                                event.matches(&e.event_type)
                                    || event.matches_opt(e.data.str_field("topic"))
                            })
                            .cloned()
                            .collect();
                        if narrowed.is_empty() {
                            return None;
                        }
                        narrowed
                    }
                };
                Some(events)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventData;
    use serde_json::{json, Value};

    fn tx(id: &str, ty: &str, contract: Option<&str>, function: Option<&str>) -> Transaction {
        Transaction {
            tx_id: id.into(),
            block_height: 100,
            tx_type: ty.into(),
            sender: "SP_SENDER".into(),
            status: "success".into(),
            contract_id: contract.map(Into::into),
            function_name: function.map(Into::into),
        }
    }

    fn ev(id: &str, tx_id: &str, index: u32, ty: &str, data: Value) -> ChainEvent {
        ChainEvent {
            id: id.into(),
            tx_id: tx_id.into(),
            block_height: 100,
            event_index: index,
            event_type: ty.into(),
            data: EventData::from(data),
        }
    }

    #[test]
    fn glob_semantics() {
        assert!(Glob::new("SP1.*").matches("SP1.dex"));
        assert!(!Glob::new("SP1.*").matches("SP2.dex"));
        assert!(Glob::new("*").matches("anything"));
        assert!(Glob::new("SP1.dex").matches("SP1.dex"));
        assert!(!Glob::new("SP1.dex").matches("SP1.dex-v2"));
        // Regex metacharacters are literal.
        assert!(!Glob::new("SP1.dex").matches("SP1xdex"));
        assert!(Glob::new("a+b*").matches("a+bc"));
    }

    #[test]
    fn min_amount_filters_events() {
        let txs = vec![tx("0x1", "token_transfer", None, None), tx("0x2", "token_transfer", None, None)];
        let events = vec![
            ev("e1", "0x1", 0, "stx_transfer_event", json!({"amount": "5000000"})),
            ev("e2", "0x2", 0, "stx_transfer_event", json!({"amount": 500})),
        ];
        let sources = vec![Source::tx_type("token_transfer").min_amount(1_000_000)];
        let matched = match_sources(&sources, &txs, &events);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].tx.tx_id, "0x1");
        assert_eq!(matched[0].events.len(), 1);
        assert_eq!(matched[0].source_key, "token_transfer");
    }

    #[test]
    fn type_source_without_events_is_tx_level() {
        let txs = vec![tx("0x1", "token_transfer", None, None)];
        let matched = match_sources(&[Source::tx_type("token_*")], &txs, &[]);
        assert_eq!(matched.len(), 1);
        assert!(matched[0].events.is_empty());
    }

    #[test]
    fn identical_sources_dedupe() {
        let txs = vec![tx("0x1", "contract_call", Some("SP1.dex"), Some("swap"))];
        let events = vec![ev("e1", "0x1", 0, "smart_contract_event", json!({"topic": "swap"}))];
        let sources = vec![Source::contract("SP1.dex"), Source::contract("SP1.dex")];
        let matched = match_sources(&sources, &txs, &events);
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn distinct_sources_yield_one_entry_each() {
        let txs = vec![tx("0x1", "contract_call", Some("SP1.dex"), Some("swap"))];
        let sources = vec![Source::contract("SP1.dex"), Source::contract("SP1.dex").function("swap")];
        let matched = match_sources(&sources, &txs, &[]);
        let keys: Vec<_> = matched.iter().map(|m| m.source_key.as_str()).collect();
        assert_eq!(keys, vec!["SP1.dex", "SP1.dex::swap"]);
    }

    #[test]
    fn inner_contract_events_qualify() {
        let txs = vec![tx("0x1", "contract_call", Some("SP1.router"), Some("route"))];
        let events = vec![
            ev("e1", "0x1", 0, "smart_contract_event", json!({"contract_identifier": "SP1.pool", "topic": "swap"})),
            ev("e2", "0x1", 1, "smart_contract_event", json!({"contract_identifier": "SP1.router", "topic": "routed"})),
        ];
        let matched = match_sources(&[Source::contract("SP1.pool")], &txs, &events);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].events.len(), 1);
        assert_eq!(matched[0].events[0].id, "e1");

        // A direct match keeps every event of the transaction.
        let matched = match_sources(&[Source::contract("SP1.router")], &txs, &events);
        assert_eq!(matched[0].events.len(), 2);
    }

    #[test]
    fn function_filter_excludes_missing_function_name() {
        let txs = vec![
            tx("0x1", "contract_call", Some("SP1.dex"), Some("swap")),
            tx("0x2", "contract_call", Some("SP1.dex"), Some("add-liquidity")),
            tx("0x3", "smart_contract", Some("SP1.dex"), None),
        ];
        let matched = match_sources(&[Source::contract("SP1.dex").function("swap*")], &txs, &[]);
        let ids: Vec<_> = matched.iter().map(|m| m.tx.tx_id.as_str()).collect();
        assert_eq!(ids, vec!["0x1"]);
    }

    #[test]
    fn event_filter_by_type_or_topic() {
        let txs = vec![tx("0x1", "contract_call", Some("SP1.dex"), Some("swap"))];
        let events = vec![
            ev("e1", "0x1", 0, "smart_contract_event", json!({"topic": "swap"})),
            ev("e2", "0x1", 1, "ft_transfer_event", json!({"amount": 1})),
        ];
        let by_topic = match_sources(&[Source::contract("SP1.dex").event("swap")], &txs, &events);
        assert_eq!(by_topic[0].events.len(), 1);
        assert_eq!(by_topic[0].events[0].id, "e1");

        let by_type =
            match_sources(&[Source::contract("SP1.dex").event("ft_transfer_event")], &txs, &events);
        assert_eq!(by_type[0].events[0].id, "e2");

        let none = match_sources(&[Source::contract("SP1.dex").event("burn")], &txs, &events);
        assert!(none.is_empty());
    }

    #[test]
    fn events_are_ordered_by_index() {
        let txs = vec![tx("0x1", "contract_call", Some("SP1.dex"), None)];
        let events = vec![
            ev("e2", "0x1", 1, "print", json!({})),
            ev("e1", "0x1", 0, "print", json!({})),
        ];
        let matched = match_sources(&[Source::contract("*")], &txs, &events);
        let ids: Vec<_> = matched[0].events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2"]);
    }
}
