//! Request matching engine.
//!
//! Computes a non-negative score for a request against a matcher
//! descriptor, or `None` for a hard miss. The matcher is pure: it never
//! writes to the exchange or the stores.

use std::collections::{BTreeMap, HashMap};

use regex::Regex;

use crate::config::{
    BodyMatchConfig, BodyPredicate, MatchCondition, MatchOperator, RequestMatcher, Resource,
};
use crate::exchange::Exchange;
use crate::query::{self, QueryOutcome};
use crate::template::TemplateContext;
use crate::wsdl::SoapContext;

/// A successful match: the accumulated score and whether the path ended
/// in a trailing wildcard.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MatchResult {
    pub score: u32,
    pub wildcard: bool,
}

/// Score a request against a matcher descriptor. Every satisfied
/// criterion adds to the score; any failed criterion rejects the
/// candidate outright.
pub fn score_matcher(
    matcher: &RequestMatcher,
    exchange: &Exchange,
    tctx: &TemplateContext<'_>,
    system_namespaces: &BTreeMap<String, String>,
    soap: Option<&SoapContext>,
) -> Option<MatchResult> {
    let request = &exchange.request;
    let mut score = 0u32;
    let mut wildcard = false;

    if let Some(method) = &matcher.method {
        if !method.is_empty() {
            if method != request.method() {
                return None;
            }
            score += 1;
        }
    }

    if let Some(path) = &matcher.path {
        if !path.is_empty() {
            score += score_path(path, request.path(), &matcher.path_params)?;
            wildcard = path.split('/').next_back() == Some("*");
        }
    }

    for (name, condition) in &matcher.request_headers {
        let actual = request.header(name).unwrap_or_default();
        if !condition_matches(condition, actual) {
            return None;
        }
        score += 1;
    }

    for (name, condition) in &matcher.query_params {
        let actual = request.query_param(name).unwrap_or_default();
        if !condition_matches(condition, actual) {
            return None;
        }
        score += 1;
    }

    for (name, condition) in &matcher.form_params {
        let actual = request.form_param(name).unwrap_or_default();
        if !condition_matches(condition, actual) {
            return None;
        }
        score += 1;
    }

    if let Some(body) = &matcher.request_body {
        score += score_body(body, exchange, system_namespaces)?;
    }

    if !matcher.all_of.is_empty() {
        for predicate in &matcher.all_of {
            let rendered = tctx.render(&predicate.expression);
            if !condition_matches(&predicate.condition, &rendered) {
                return None;
            }
        }
        score += matcher.all_of.len() as u32;
    } else if !matcher.any_of.is_empty() {
        let any = matcher.any_of.iter().any(|predicate| {
            condition_matches(&predicate.condition, &tctx.render(&predicate.expression))
        });
        if !any {
            return None;
        }
        score += 1;
    }

    // SOAP extensions score like any other criterion
    for (expected, actual) in [
        (&matcher.operation, soap.and_then(|s| s.operation.as_deref())),
        (
            &matcher.soap_action,
            soap.and_then(|s| s.soap_action.as_deref()),
        ),
        (&matcher.binding, soap.and_then(|s| s.binding.as_deref())),
    ] {
        if let Some(expected) = expected {
            if Some(expected.as_str()) != actual {
                return None;
            }
            score += 1;
        }
    }

    Some(MatchResult { score, wildcard })
}

/// Evaluate a match condition against an observed value. Absent values
/// arrive here as the empty string.
pub fn condition_matches(condition: &MatchCondition, actual: &str) -> bool {
    match condition.operator {
        MatchOperator::EqualTo => actual == condition.value,
        MatchOperator::NotEqualTo => actual != condition.value,
        MatchOperator::Contains => actual.contains(&condition.value),
        MatchOperator::NotContains => !actual.contains(&condition.value),
        MatchOperator::Matches => match Regex::new(&condition.value) {
            Ok(re) => re.is_match(actual),
            Err(e) => {
                warn!("invalid match regex {:?}: {}", condition.value, e);
                false
            }
        },
        MatchOperator::NotMatches => match Regex::new(&condition.value) {
            Ok(re) => !re.is_match(actual),
            Err(e) => {
                warn!("invalid match regex {:?}: {}", condition.value, e);
                false
            }
        },
        MatchOperator::Exists => !actual.is_empty(),
        MatchOperator::NotExists => actual.is_empty(),
    }
}

/// One segment of a path template.
enum Segment<'a> {
    Literal(&'a str),
    /// A pure `{name}` parameter.
    Param(&'a str),
    /// Literal text mixed with parameters, e.g. `{version}.diff`.
    Mixed(Vec<MixedPart<'a>>),
}

enum MixedPart<'a> {
    Literal(&'a str),
    Param(&'a str),
}

fn parse_segment(segment: &str) -> Segment<'_> {
    if !segment.contains('{') {
        return Segment::Literal(segment);
    }
    if segment.starts_with('{') && segment.ends_with('}') && segment.matches('{').count() == 1 {
        return Segment::Param(&segment[1..segment.len() - 1]);
    }
    let mut parts = Vec::new();
    let mut rest = segment;
    while let Some(open) = rest.find('{') {
        if open > 0 {
            parts.push(MixedPart::Literal(&rest[..open]));
        }
        match rest[open..].find('}') {
            Some(close) => {
                parts.push(MixedPart::Param(&rest[open + 1..open + close]));
                rest = &rest[open + close + 1..];
            }
            None => {
                // unbalanced brace: treat the remainder literally
                parts.push(MixedPart::Literal(&rest[open..]));
                rest = "";
            }
        }
    }
    if !rest.is_empty() {
        parts.push(MixedPart::Literal(rest));
    }
    Segment::Mixed(parts)
}

/// Regex for a mixed segment; parameters become positional capture
/// groups in declaration order.
fn mixed_regex(parts: &[MixedPart<'_>]) -> Option<Regex> {
    let mut pattern = String::from("^");
    for part in parts {
        match part {
            MixedPart::Literal(text) => pattern.push_str(&regex::escape(text)),
            MixedPart::Param(_) => pattern.push_str("([^/]+)"),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).ok()
}

/// Capture values for a mixed segment, keyed by parameter name.
fn mixed_captures<'p>(
    parts: &[MixedPart<'p>],
    captures: &regex::Captures<'_>,
) -> Vec<(&'p str, String)> {
    let mut group = 0;
    let mut values = Vec::new();
    for part in parts {
        if let MixedPart::Param(name) = part {
            group += 1;
            let value = captures
                .get(group)
                .map(|m| m.as_str().to_owned())
                .unwrap_or_default();
            values.push((*name, value));
        }
    }
    values
}

/// Align template and request path segments, scoring per the rules:
/// literal +1, pure parameter +1 (+1 for a matching condition), mixed
/// segment +2 (+1 per matching condition), trailing `*` truncates.
fn score_path(
    template: &str,
    path: &str,
    conditions: &BTreeMap<String, MatchCondition>,
) -> Option<u32> {
    let mut template_segments: Vec<&str> = template.split('/').collect();
    let mut path_segments: Vec<&str> = path.split('/').collect();

    if template_segments.last() == Some(&"*") {
        template_segments.pop();
        if path_segments.len() < template_segments.len() {
            return None;
        }
        path_segments.truncate(template_segments.len());
    } else if template_segments.len() != path_segments.len() {
        return None;
    }

    let mut score = 0u32;
    for (tseg, pseg) in template_segments.iter().zip(&path_segments) {
        match parse_segment(tseg) {
            Segment::Literal(literal) => {
                if literal != *pseg {
                    return None;
                }
                if !literal.is_empty() {
                    score += 1;
                }
            }
            Segment::Param(name) => {
                score += 1;
                if let Some(condition) = conditions.get(name) {
                    if !condition_matches(condition, pseg) {
                        return None;
                    }
                    score += 1;
                }
            }
            Segment::Mixed(parts) => {
                let re = mixed_regex(&parts)?;
                let captures = re.captures(pseg)?;
                // mixed segments outrank pure parameters
                score += 2;
                for (name, actual) in mixed_captures(&parts, &captures) {
                    if let Some(condition) = conditions.get(name) {
                        if !condition_matches(condition, &actual) {
                            return None;
                        }
                        score += 1;
                    }
                }
            }
        }
    }
    Some(score)
}

/// Extract named path parameters by aligning the request path against a
/// path template. Segments that do not align contribute nothing.
pub fn extract_path_params(template: &str, path: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let template_segments: Vec<&str> = template.split('/').collect();
    let path_segments: Vec<&str> = path.split('/').collect();

    for (tseg, pseg) in template_segments.iter().zip(&path_segments) {
        if *tseg == "*" {
            break;
        }
        match parse_segment(tseg) {
            Segment::Param(name) => {
                params.insert(name.to_owned(), (*pseg).to_owned());
            }
            Segment::Mixed(parts) => {
                if let Some(captures) = mixed_regex(&parts).and_then(|re| re.captures(pseg)) {
                    for (name, value) in mixed_captures(&parts, &captures) {
                        params.insert(name.to_owned(), value);
                    }
                }
            }
            Segment::Literal(_) => {}
        }
    }
    params
}

fn score_body(
    body: &BodyMatchConfig,
    exchange: &Exchange,
    system_namespaces: &BTreeMap<String, String>,
) -> Option<u32> {
    if !body.all_of.is_empty() {
        for predicate in &body.all_of {
            if !body_predicate_matches(predicate, exchange, system_namespaces) {
                return None;
            }
        }
        Some(body.all_of.len() as u32)
    } else if !body.any_of.is_empty() {
        body.any_of
            .iter()
            .any(|predicate| body_predicate_matches(predicate, exchange, system_namespaces))
            .then_some(1)
    } else {
        body_predicate_matches(&body.single, exchange, system_namespaces).then_some(1)
    }
}

fn body_predicate_matches(
    predicate: &BodyPredicate,
    exchange: &Exchange,
    system_namespaces: &BTreeMap<String, String>,
) -> bool {
    let body = exchange.request.body_string();
    let condition = MatchCondition {
        value: predicate.value.clone(),
        operator: predicate.operator,
    };

    if let Some(path) = &predicate.json_path {
        return match query::json_query(&body, path).resolve() {
            Some(projected) => condition_matches(&condition, &projected),
            None => false,
        };
    }
    if let Some(path) = &predicate.x_path {
        let mut namespaces = system_namespaces.clone();
        namespaces.extend(predicate.xml_namespaces.clone());
        return match query::xml_query(&body, path, &namespaces) {
            QueryOutcome::Value(projected) => condition_matches(&condition, &projected),
            QueryOutcome::Empty => condition_matches(&condition, ""),
            QueryOutcome::ParseFailure => false,
        };
    }
    condition_matches(&condition, &body)
}

/// A scored resource awaiting selection.
pub struct Candidate<'a> {
    pub resource: &'a Resource,
    pub result: MatchResult,
    pub index: usize,
}

/// Best-match selection: highest score wins, non-wildcard beats wildcard
/// on a tie, and remaining ties go to the earliest declaration (logged as
/// an ambiguity).
pub fn select_best<'a>(candidates: Vec<Candidate<'a>>) -> Option<Candidate<'a>> {
    let mut best: Option<Candidate<'a>> = None;
    let mut tied = 0usize;

    for candidate in candidates {
        match &best {
            None => best = Some(candidate),
            Some(current) => {
                if candidate.result.score > current.result.score {
                    best = Some(candidate);
                    tied = 0;
                } else if candidate.result.score == current.result.score {
                    if current.result.wildcard && !candidate.result.wildcard {
                        best = Some(candidate);
                        tied = 0;
                    } else if current.result.wildcard == candidate.result.wildcard {
                        tied += 1;
                    }
                }
            }
        }
    }

    if tied > 0 {
        if let Some(best) = &best {
            warn!(
                "ambiguous match: {} further resource(s) scored {}, using declaration order",
                tied, best.result.score
            );
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImposterConfig;
    use crate::store::{inmemory::InMemoryStoreProvider, StoreFactory};
    use crate::template::ServerInfo;
    use bytes::Bytes;
    use std::sync::Arc;

    fn factory() -> StoreFactory {
        StoreFactory::new(Arc::new(InMemoryStoreProvider::new(None)))
    }

    fn exchange(method: &str, uri: &str, body: &str) -> Exchange {
        let factory = factory();
        Exchange::new(
            crate::exchange::RequestView::new(
                method,
                uri,
                vec![],
                Bytes::from(body.as_bytes().to_vec()),
            ),
            factory.request_store(),
        )
    }

    fn score(matcher: &RequestMatcher, exchange: &Exchange) -> Option<MatchResult> {
        let factory = factory();
        let server = ServerInfo {
            port: 8080,
            url: "http://localhost:8080".to_owned(),
        };
        let tctx = TemplateContext::new(exchange, &factory, &server);
        score_matcher(matcher, exchange, &tctx, &BTreeMap::new(), None)
    }

    fn matcher_yaml(yaml: &str) -> RequestMatcher {
        let config =
            ImposterConfig::from_yaml(&format!("resources:\n  - {}", yaml.replace('\n', "\n    ")))
                .unwrap();
        config.resources[0].matcher.clone()
    }

    #[test]
    fn empty_matcher_scores_zero() {
        let ex = exchange("GET", "/anything", "");
        let result = score(&RequestMatcher::default(), &ex).unwrap();
        assert_eq!(result.score, 0);
        assert!(!result.wildcard);
    }

    #[test]
    fn satisfied_criteria_strictly_increase_the_score() {
        let ex = exchange("GET", "/pets?verbose=true", "");

        let base = matcher_yaml("path: /pets\nresponse: {content: x}");
        let base_score = score(&base, &ex).unwrap().score;

        let with_method = matcher_yaml("method: GET\npath: /pets\nresponse: {content: x}");
        let method_score = score(&with_method, &ex).unwrap().score;
        assert!(method_score > base_score);

        let with_query = matcher_yaml(
            "method: GET\npath: /pets\nqueryParams: {verbose: \"true\"}\nresponse: {content: x}",
        );
        assert!(score(&with_query, &ex).unwrap().score > method_score);
    }

    #[test]
    fn unsatisfied_mandatory_criterion_is_a_hard_miss() {
        let ex = exchange("GET", "/pets", "");
        let matcher = matcher_yaml(
            "method: GET\npath: /pets\nrequestHeaders: {X-Api-Key: secret}\nresponse: {content: x}",
        );
        assert_eq!(score(&matcher, &ex), None);
    }

    #[test]
    fn wrong_method_is_a_hard_miss() {
        let ex = exchange("POST", "/pets", "");
        let matcher = matcher_yaml("method: GET\npath: /pets\nresponse: {content: x}");
        assert_eq!(score(&matcher, &ex), None);
    }

    #[test]
    fn path_parameters_match_and_extract() {
        let ex = exchange("GET", "/users/42", "");
        let matcher = matcher_yaml("path: /users/{id}\nresponse: {content: x}");
        assert!(score(&matcher, &ex).is_some());

        let params = extract_path_params("/users/{id}", "/users/42");
        assert_eq!(params["id"], "42");
    }

    #[test]
    fn path_parameter_condition_mismatch_is_a_hard_miss() {
        let ex = exchange("GET", "/users/42", "");
        let matcher = matcher_yaml(
            "path: /users/{id}\npathParams: {id: \"99\"}\nresponse: {content: x}",
        );
        assert_eq!(score(&matcher, &ex), None);

        let ex_ok = exchange("GET", "/users/99", "");
        assert!(score(&matcher, &ex_ok).is_some());
    }

    #[test]
    fn mixed_segment_outscores_pure_parameter() {
        let ex = exchange("GET", "/example/123.diff", "");
        let mixed = matcher_yaml("path: /example/{version}.diff\nresponse: {content: x}");
        let pure = matcher_yaml("path: /example/{version}\nresponse: {content: x}");

        let mixed_score = score(&mixed, &ex).unwrap().score;
        let pure_score = score(&pure, &ex).unwrap().score;
        assert!(mixed_score > pure_score);

        let params = extract_path_params("/example/{version}.diff", "/example/123.diff");
        assert_eq!(params["version"], "123");
    }

    #[test]
    fn trailing_wildcard_matches_deeper_paths() {
        let matcher = matcher_yaml("path: /static/*\nresponse: {content: x}");

        let ex = exchange("GET", "/static/css/site.css", "");
        let result = score(&matcher, &ex).unwrap();
        assert!(result.wildcard);

        let miss = exchange("GET", "/other", "");
        assert_eq!(score(&matcher, &miss), None);
    }

    #[test]
    fn json_path_body_predicate() {
        let matcher = matcher_yaml(
            "method: POST\npath: /ok\nrequestBody: {jsonPath: $.name, value: Grace}\nresponse: {content: x}",
        );

        let hit = exchange("POST", "/ok", r#"{"name": "Grace"}"#);
        assert!(score(&matcher, &hit).is_some());

        let miss = exchange("POST", "/ok", r#"{"name": "Jane"}"#);
        assert_eq!(score(&matcher, &miss), None);

        // unparsable body evaluates the predicate false
        let garbage = exchange("POST", "/ok", "{nope");
        assert_eq!(score(&matcher, &garbage), None);
    }

    #[test]
    fn body_all_of_scores_per_predicate() {
        let matcher = matcher_yaml(
            "requestBody:\n  allOf:\n    - {jsonPath: $.a, value: \"1\"}\n    - {jsonPath: $.b, value: \"2\"}\nresponse: {content: x}",
        );
        let hit = exchange("POST", "/x", r#"{"a": "1", "b": "2"}"#);
        assert_eq!(score(&matcher, &hit).unwrap().score, 2);

        let partial = exchange("POST", "/x", r#"{"a": "1", "b": "3"}"#);
        assert_eq!(score(&matcher, &partial), None);
    }

    #[test]
    fn body_any_of_scores_one() {
        let matcher = matcher_yaml(
            "requestBody:\n  anyOf:\n    - {jsonPath: $.a, value: \"1\"}\n    - {jsonPath: $.b, value: \"2\"}\nresponse: {content: x}",
        );
        let hit = exchange("POST", "/x", r#"{"b": "2"}"#);
        assert_eq!(score(&matcher, &hit).unwrap().score, 1);
    }

    #[test]
    fn operators_cover_absence_and_patterns() {
        let condition = |value: &str, operator| MatchCondition {
            value: value.to_owned(),
            operator,
        };
        assert!(condition_matches(&condition("", MatchOperator::NotExists), ""));
        assert!(condition_matches(&condition("", MatchOperator::Exists), "x"));
        assert!(condition_matches(
            &condition("^[0-9]+$", MatchOperator::Matches),
            "123"
        ));
        assert!(condition_matches(
            &condition("^[0-9]+$", MatchOperator::NotMatches),
            "abc"
        ));
        assert!(condition_matches(&condition("et", MatchOperator::Contains), "pets"));
        assert!(!condition_matches(
            &condition("(unclosed", MatchOperator::Matches),
            "anything"
        ));
    }

    #[test]
    fn selection_is_deterministic_and_prefers_non_wildcard() {
        let config = ImposterConfig::from_yaml(
            r#"
resources:
  - path: /static/*
    response: {content: wild}
  - path: /static/{file}
    response: {content: exact}
"#,
        )
        .unwrap();

        for _ in 0..3 {
            let candidates = vec![
                Candidate {
                    resource: &config.resources[0],
                    result: MatchResult {
                        score: 2,
                        wildcard: true,
                    },
                    index: 0,
                },
                Candidate {
                    resource: &config.resources[1],
                    result: MatchResult {
                        score: 2,
                        wildcard: false,
                    },
                    index: 1,
                },
            ];
            let best = select_best(candidates).unwrap();
            assert_eq!(best.index, 1);
        }
    }

    #[test]
    fn tie_uses_declaration_order() {
        let config = ImposterConfig::from_yaml(
            r#"
resources:
  - path: /a
    response: {content: first}
  - path: /a
    response: {content: second}
"#,
        )
        .unwrap();
        let candidates = config
            .resources
            .iter()
            .enumerate()
            .map(|(index, resource)| Candidate {
                resource,
                result: MatchResult {
                    score: 1,
                    wildcard: false,
                },
                index,
            })
            .collect();
        assert_eq!(select_best(candidates).unwrap().index, 0);
    }
}
