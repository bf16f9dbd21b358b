//! Per-request context carried through the middleware chain.

use crate::Request;

/// Per-request context handed to each [`Middleware`](crate::middleware::Middleware).
pub struct Context {
    request: Request,
}

impl Context {
    /// Create a new context from a request
    pub fn new(request: Request) -> Self {
        Self { request }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Consumes the context, returning the request it carried.
    pub fn into_request(self) -> Request {
        self.request
    }

    /// Deserializes the request body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(self.request.body())
    }

    /// The `operationName` of a GraphQL-style JSON body, if it names one.
    pub fn operation_name(&self) -> Option<String> {
        #[derive(serde::Deserialize)]
        struct Operation {
            #[serde(rename = "operationName")]
            operation_name: Option<String>,
        }

        self.json::<Operation>().ok()?.operation_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Method;

    #[derive(serde::Deserialize)]
    struct Query {
        query: String,
    }

    #[test]
    fn json_reads_body() {
        let ctx = Context::new(
            Request::new(Method::Post, "/graphql").with_body(r#"{"query":"{ping}"}"#),
        );
        let q: Query = ctx.json().unwrap();
        assert_eq!(q.query, "{ping}");
        assert_eq!(ctx.operation_name(), None);
        assert_eq!(ctx.into_request().path(), "/graphql");
    }

    #[test]
    fn operation_name_is_read_from_body() {
        let named = Context::new(
            Request::new(Method::Post, "/graphql")
                .with_body(r#"{"operationName":"Ping","query":"query Ping { ping }"}"#),
        );
        assert_eq!(named.operation_name().as_deref(), Some("Ping"));

        let not_json = Context::new(Request::new(Method::Post, "/graphql").with_body("ping"));
        assert_eq!(not_json.operation_name(), None);
    }
}
