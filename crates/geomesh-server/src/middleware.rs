use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};

/// Header carrying the caller's user id.
pub const USER_ID_HEADER: &str = "X-User-Id";

/// Authenticated caller, stored in request extensions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserContext(pub String);

/// Resolves the caller from `X-User-Id` or `Authorization: Bearer`.
///
/// Session issuance lives outside this server; the bearer token is taken
/// to be the user id.
pub async fn auth_middleware(mut req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let user_id = if let Some(val) = req.headers().get(USER_ID_HEADER) {
        val.to_str()
            .map_err(|_| StatusCode::UNAUTHORIZED)?
            .trim()
            .to_string()
    } else if let Some(val) = req.headers().get(axum::http::header::AUTHORIZATION) {
        let val_str = val.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?;
        match val_str.strip_prefix("Bearer ") {
            Some(token) => token.trim().to_string(),
            None => return Err(StatusCode::UNAUTHORIZED),
        }
    } else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    if user_id.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    req.extensions_mut().insert(UserContext(user_id));
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Extension, Router};
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route(
                "/me",
                get(|Extension(UserContext(id)): Extension<UserContext>| async move { id }),
            )
            .layer(axum::middleware::from_fn(auth_middleware))
    }

    async fn call(header: Option<(&str, &str)>) -> (StatusCode, String) {
        let mut builder = Request::builder().uri("/me");
        if let Some((name, value)) = header {
            builder = builder.header(name, value);
        }
        let response = app()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn user_header_is_accepted() {
        assert_eq!(
            call(Some((USER_ID_HEADER, "alice"))).await,
            (StatusCode::OK, "alice".to_string())
        );
    }

    #[tokio::test]
    async fn bearer_token_is_accepted() {
        assert_eq!(
            call(Some(("Authorization", "Bearer bob"))).await,
            (StatusCode::OK, "bob".to_string())
        );
    }

    #[tokio::test]
    async fn missing_or_blank_identity_is_rejected() {
        assert_eq!(call(None).await.0, StatusCode::UNAUTHORIZED);
        assert_eq!(call(Some((USER_ID_HEADER, "  "))).await.0, StatusCode::UNAUTHORIZED);
        assert_eq!(
            call(Some(("Authorization", "Basic abc"))).await.0,
            StatusCode::UNAUTHORIZED
        );
    }
}
