use serde::Serialize;

/// A GraphQL-over-HTTP request body.
///
/// For code-generated operations use [`GraphQlClient::post`](crate::GraphQlClient::post)
/// with a `graphql_client::GraphQLQuery` instead.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphQlRequest<V = serde_json::Value> {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<V>,
    #[serde(rename = "operationName", skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
}

impl GraphQlRequest {
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            variables: None,
            operation_name: None,
        }
    }
}

impl<V> GraphQlRequest<V> {
    #[must_use]
    pub fn with_variables<W>(self, variables: W) -> GraphQlRequest<W> {
        GraphQlRequest {
            query: self.query,
            variables: Some(variables),
            operation_name: self.operation_name,
        }
    }

    #[must_use]
    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_query_omits_optional_fields() {
        let body = serde_json::to_value(GraphQlRequest::new("{ site { name } }")).unwrap();
        assert_eq!(body, json!({ "query": "{ site { name } }" }));
    }

    #[test]
    fn wire_names_match_graphql_over_http() {
        let req = GraphQlRequest::new("query Item($path: String!) { item(path: $path) { id } }")
            .with_variables(json!({ "path": "/home" }))
            .with_operation_name("Item");
        let body = serde_json::to_value(req).unwrap();
        assert_eq!(body["operationName"], "Item");
        assert_eq!(body["variables"]["path"], "/home");
    }

    #[test]
    fn typed_variables_serialize() {
        #[derive(Serialize)]
        struct Vars {
            first: u32,
        }
        let req = GraphQlRequest::new("query($first: Int) { a }").with_variables(Vars { first: 3 });
        let body = serde_json::to_value(req).unwrap();
        assert_eq!(body["variables"], json!({ "first": 3 }));
    }
}
