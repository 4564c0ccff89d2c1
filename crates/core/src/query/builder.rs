//! Immutable builder for encoded table queries
//!
//! Every method consumes the builder and returns a new one, so a partially
//! built query can be cloned and reused as a template:
//!
//! ```
//! use ticketline_core::query::EncodedQuery;
//!
//! let open = EncodedQuery::new("incident").add_query("active", "true");
//! let mine = open.clone().add_query("assigned_to", "abc").order_by("number");
//!
//! assert_eq!(open.build(), "active=true");
//! assert_eq!(mine.build(), "active=true^assigned_to=abc^ORDERBYnumber");
//! ```
//!
//! Terms are kept in insertion order and are neither deduplicated nor
//! validated; the server rejects malformed filters at execution time.

use std::fmt;

use super::operator::Operator;

const AND: &str = "^";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Condition {
    field: String,
    operator: Operator,
    value: String,
}

impl Condition {
    fn new(field: impl Into<String>, operator: Operator, value: impl Into<String>) -> Self {
        Self { field: field.into(), operator, value: value.into() }
    }

    fn encode(&self) -> String {
        if self.operator.is_unary() {
            format!("{}{}", self.field, self.operator)
        } else {
            format!("{}{}{}", self.field, self.operator, self.value)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Term {
    Condition(Condition),
    Or(Condition),
    Join { primary_field: String, join_table: String, join_field: String, sub: EncodedQuery },
    RelatedList { table: String, field: String, condition: String, sub: EncodedQuery },
    OrderBy(String),
    OrderByDesc(String),
    Encoded(String),
}

/// Insertion-ordered condition tree for one table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedQuery {
    table: String,
    terms: Vec<Term>,
}

impl EncodedQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self { table: table.into(), terms: Vec::new() }
    }

    /// Table the query is scoped to; join blocks use it as the primary side.
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    fn push(mut self, term: Term) -> Self {
        self.terms.push(term);
        self
    }

    /// `<field>=<value>`
    #[must_use]
    pub fn add_query(self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_condition(field, Operator::Eq, value)
    }

    /// `<field><operator><value>`
    #[must_use]
    pub fn add_condition(
        self,
        field: impl Into<String>,
        operator: impl Into<Operator>,
        value: impl Into<String>,
    ) -> Self {
        self.push(Term::Condition(Condition::new(field, operator.into(), value)))
    }

    /// `active=true`
    #[must_use]
    pub fn add_active_query(self) -> Self {
        self.add_query("active", "true")
    }

    /// `<field>IN<v1,v2,...>`
    #[must_use]
    pub fn add_in_query<I, V>(self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: fmt::Display,
    {
        self.add_condition(field, Operator::In, join_values(values))
    }

    /// `<field>NOT IN<v1,v2,...>`
    #[must_use]
    pub fn add_not_in_query<I, V>(self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: fmt::Display,
    {
        self.add_condition(field, Operator::NotIn, join_values(values))
    }

    /// `<field>ISEMPTY`
    #[must_use]
    pub fn add_null_query(self, field: impl Into<String>) -> Self {
        self.add_condition(field, Operator::IsEmpty, "")
    }

    /// `<field>ISNOTEMPTY`
    #[must_use]
    pub fn add_not_null_query(self, field: impl Into<String>) -> Self {
        self.add_condition(field, Operator::IsNotEmpty, "")
    }

    /// `^OR<field>=<value>`, OR-ed with the term before it.
    #[must_use]
    pub fn add_or_condition(self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_or_condition_with(field, Operator::Eq, value)
    }

    /// `^OR<field><operator><value>`
    #[must_use]
    pub fn add_or_condition_with(
        self,
        field: impl Into<String>,
        operator: impl Into<Operator>,
        value: impl Into<String>,
    ) -> Self {
        self.push(Term::Or(Condition::new(field, operator.into(), value)))
    }

    /// `JOIN<table>.<primary_field>=<join_table>.<join_field>!<sub>`
    ///
    /// `scope` receives an empty builder for `join_table` and returns the
    /// subconditions.
    #[must_use]
    pub fn add_join_query<F>(
        self,
        join_table: impl Into<String>,
        primary_field: impl Into<String>,
        join_field: impl Into<String>,
        scope: F,
    ) -> Self
    where
        F: FnOnce(Self) -> Self,
    {
        let join_table = join_table.into();
        let sub = scope(Self::new(join_table.clone()));
        self.push(Term::Join {
            primary_field: primary_field.into(),
            join_table,
            join_field: join_field.into(),
            sub,
        })
    }

    /// `RLQUERY<table>.<field>,<condition>^<sub>^ENDRLQUERY`
    ///
    /// `condition` is the aggregate test on the related rows, e.g. `>=1`.
    #[must_use]
    pub fn add_rl_query<F>(
        self,
        related_table: impl Into<String>,
        related_field: impl Into<String>,
        condition: impl Into<String>,
        scope: F,
    ) -> Self
    where
        F: FnOnce(Self) -> Self,
    {
        let table = related_table.into();
        let sub = scope(Self::new(table.clone()));
        self.push(Term::RelatedList {
            table,
            field: related_field.into(),
            condition: condition.into(),
            sub,
        })
    }

    /// Appends an ascending directive; earlier directives are kept.
    #[must_use]
    pub fn order_by(self, field: impl Into<String>) -> Self {
        self.push(Term::OrderBy(field.into()))
    }

    #[must_use]
    pub fn order_by_desc(self, field: impl Into<String>) -> Self {
        self.push(Term::OrderByDesc(field.into()))
    }

    /// Splice a pre-encoded fragment verbatim. Empty fragments are dropped.
    #[must_use]
    pub fn add_encoded_query(self, raw: impl Into<String>) -> Self {
        let raw = raw.into();
        if raw.is_empty() {
            return self;
        }
        self.push(Term::Encoded(raw))
    }

    /// The `^`-joined filter string; empty when there are no terms.
    pub fn build(&self) -> String {
        let mut parts = Vec::with_capacity(self.terms.len());
        for term in &self.terms {
            parts.push(self.encode(term));
        }
        parts.join(AND)
    }

    fn encode(&self, term: &Term) -> String {
        match term {
            Term::Condition(condition) => condition.encode(),
            Term::Or(condition) => format!("OR{}", condition.encode()),
            Term::Join { primary_field, join_table, join_field, sub } => {
                let head = format!("JOIN{}.{primary_field}={join_table}.{join_field}", self.table);
                if sub.is_empty() {
                    head
                } else {
                    format!("{head}!{}", sub.build())
                }
            }
            Term::RelatedList { table, field, condition, sub } => {
                if sub.is_empty() {
                    format!("RLQUERY{table}.{field},{condition}^ENDRLQUERY")
                } else {
                    format!("RLQUERY{table}.{field},{condition}^{}^ENDRLQUERY", sub.build())
                }
            }
            Term::OrderBy(field) => format!("ORDERBY{field}"),
            Term::OrderByDesc(field) => format!("ORDERBYDESC{field}"),
            Term::Encoded(raw) => raw.clone(),
        }
    }
}

impl fmt::Display for EncodedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.build())
    }
}

fn join_values<I, V>(values: I) -> String
where
    I: IntoIterator<Item = V>,
    V: fmt::Display,
{
    values.into_iter().map(|v| v.to_string()).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incident() -> EncodedQuery {
        EncodedQuery::new("incident")
    }

    /// Validates `EncodedQuery::add_condition` behavior for the atomic term
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms each comparison operator encodes as field, operator, value.
    /// - Confirms unary operators encode without a value.
    #[test]
    fn atomic_terms_encode_exactly() {
        let cases = [
            (incident().add_query("state", "1"), "state=1"),
            (incident().add_condition("priority", "<=", "2"), "priority<=2"),
            (incident().add_condition("priority", "!=", "5"), "priority!=5"),
            (incident().add_condition("reassignment_count", ">", "3"), "reassignment_count>3"),
            (incident().add_condition("opened_at", ">=", "2024-01-01"), "opened_at>=2024-01-01"),
            (incident().add_condition("impact", Operator::Lt, "3"), "impact<3"),
            (incident().add_active_query(), "active=true"),
            (incident().add_in_query("state", [1, 2, 3]), "stateIN1,2,3"),
            (incident().add_not_in_query("state", ["6", "7"]), "stateNOT IN6,7"),
            (incident().add_null_query("assigned_to"), "assigned_toISEMPTY"),
            (incident().add_not_null_query("assigned_to"), "assigned_toISNOTEMPTY"),
            (incident().add_condition("short_description", "LIKE", "vpn"), "short_descriptionLIKEvpn"),
            (incident().add_condition("number", "STARTSWITH", "INC"), "numberSTARTSWITHINC"),
        ];
        for (query, expected) in cases {
            assert_eq!(query.build(), expected);
        }
    }

    #[test]
    fn or_condition_joins_previous_term() {
        let query = incident().add_query("state", "1").add_or_condition("state", "2");
        assert_eq!(query.build(), "state=1^ORstate=2");

        let query = incident()
            .add_active_query()
            .add_query("priority", "1")
            .add_or_condition_with("priority", "<=", "2");
        assert_eq!(query.build(), "active=true^priority=1^ORpriority<=2");
    }

    /// Validates `EncodedQuery::add_join_query` behavior for the scoped join
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms the primary table comes from the outer builder.
    /// - Confirms subconditions follow the `!` separator.
    #[test]
    fn join_uses_outer_table() {
        let query = incident()
            .add_join_query("sys_user", "assigned_to", "sys_id", |j| j.add_query("active", "true"));
        assert_eq!(query.build(), "JOINincident.assigned_to=sys_user.sys_id!active=true");

        let bare = incident().add_join_query("sys_user", "caller_id", "sys_id", |j| j);
        assert_eq!(bare.build(), "JOINincident.caller_id=sys_user.sys_id");
    }

    #[test]
    fn related_list_block() {
        let query = EncodedQuery::new("problem").add_rl_query("incident", "problem_id", ">=1", |rl| {
            rl.add_query("priority", "1")
        });
        assert_eq!(query.build(), "RLQUERYincident.problem_id,>=1^priority=1^ENDRLQUERY");
    }

    /// Validates `EncodedQuery::order_by` behavior for the repeated ordering
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms later directives append rather than replace.
    #[test]
    fn ordering_appends() {
        let query = incident().order_by("number").add_active_query().order_by_desc("sys_created_on");
        assert_eq!(query.build(), "ORDERBYnumber^active=true^ORDERBYDESCsys_created_on");
    }

    #[test]
    fn encoded_splice_is_verbatim_and_empty_is_skipped() {
        let query = incident()
            .add_query("state", "1")
            .add_encoded_query("")
            .add_encoded_query("priority=1^ORpriority=2")
            .add_query("active", "true");
        assert_eq!(query.build(), "state=1^priority=1^ORpriority=2^active=true");
    }

    #[test]
    fn empty_tree_builds_empty_string() {
        assert_eq!(incident().build(), "");
        assert!(incident().add_encoded_query("").is_empty());
    }

    /// Validates `EncodedQuery` behavior for the template reuse scenario.
    ///
    /// Assertions:
    /// - Ensures extending a clone leaves the template untouched.
    #[test]
    fn templates_are_not_shared() {
        let template = incident().add_active_query();
        let a = template.clone().add_query("priority", "1");
        let b = template.clone().add_query("priority", "2");
        assert_eq!(template.to_string(), "active=true");
        assert_eq!(a.build(), "active=true^priority=1");
        assert_eq!(b.build(), "active=true^priority=2");
    }
}
