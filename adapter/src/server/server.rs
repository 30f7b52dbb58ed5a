use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use log::{error, info};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use warp::http::{Method, StatusCode};
use warp::path::FullPath;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::error::Error;
use crate::probes::probes::Metrics;
use crate::server::router::{tenant_handlers, Operation, Route, Router};
use crate::tenant::tenant::{
    ErrorMessage, TenantCreateRequest, TenantError, TenantManager, TenantUpdateRequest,
};

// Tenant REST server. Decode and validation failures are answered with 400,
// every other failure with 500 carrying the error text.
pub struct Server {
    router: Router,
    tenants: Arc<TenantManager>,
    metrics: Metrics,
    content_length_limit: u64,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(
        tenants: Arc<TenantManager>,
        metrics: Metrics,
        content_length_limit: u64,
        shutdown: CancellationToken,
    ) -> Server {
        Server {
            router: Router::new(tenant_handlers()),
            tenants,
            metrics,
            content_length_limit,
            shutdown,
        }
    }

    pub async fn dispatch(&self, method: &Method, path: &str, body: &[u8]) -> Response {
        let (operation, tenant) = match self.router.resolve(method, path) {
            Route::Matched { operation, mut params } => (operation, params.remove("tenant").unwrap_or_default()),
            Route::MethodNotAllowed => return error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
            Route::NotFound => return error_response(StatusCode::NOT_FOUND, "page not found"),
        };

        // Scoped to this request; dropping the guard cancels it however the handler returns.
        let request_token = self.shutdown.child_token();
        let _cancel_on_return = request_token.clone().drop_guard();

        let result = match operation {
            Operation::CreateTenant => self.create_tenant(&request_token, body).await,
            Operation::UpdateTenant => self.update_tenant(&request_token, &tenant, body).await,
            Operation::DeleteTenant => self.delete_tenant(&request_token, &tenant).await,
            Operation::GetTenant => self.get_tenant(&request_token, &tenant).await,
        };

        let response = result.unwrap_or_else(|e| {
            error!("{} tenant {:?} failed: {}", operation.as_str(), tenant, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        });
        self.metrics
            .tenant_requests
            .with_label_values(&[operation.as_str(), response.status().as_str()])
            .inc();
        response
    }

    async fn create_tenant(&self, token: &CancellationToken, body: &[u8]) -> Result<Response, TenantError> {
        let request: TenantCreateRequest = match decode(body) {
            Ok(r) => r,
            Err(bad_request) => return Ok(bad_request),
        };
        scoped(token, self.tenants.create(&request)).await?;
        Ok(warp::reply().into_response())
    }

    async fn update_tenant(&self, token: &CancellationToken, tenant: &str, body: &[u8]) -> Result<Response, TenantError> {
        let request: TenantUpdateRequest = match decode(body) {
            Ok(r) => r,
            Err(bad_request) => return Ok(bad_request),
        };
        scoped(token, self.tenants.update(tenant, &request)).await?;
        Ok(warp::reply().into_response())
    }

    async fn delete_tenant(&self, token: &CancellationToken, tenant: &str) -> Result<Response, TenantError> {
        scoped(token, self.tenants.delete(tenant)).await?;
        Ok(warp::reply().into_response())
    }

    async fn get_tenant(&self, token: &CancellationToken, tenant: &str) -> Result<Response, TenantError> {
        let info = scoped(token, self.tenants.get(tenant)).await?;
        Ok(json_response(StatusCode::OK, &info))
    }
}

// Request bodies that must pass validation before reaching the manager.
trait Validate {
    fn validate(&self) -> Result<(), TenantError>;
}

impl Validate for TenantCreateRequest {
    fn validate(&self) -> Result<(), TenantError> {
        TenantCreateRequest::validate(self)
    }
}

impl Validate for TenantUpdateRequest {
    fn validate(&self) -> Result<(), TenantError> {
        TenantUpdateRequest::validate(self)
    }
}

// Decode and validate a body, or produce the 400 response to send back.
fn decode<T>(body: &[u8]) -> Result<T, Response>
where
    T: DeserializeOwned + Validate,
{
    let request: T = serde_json::from_slice(body)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, &e.to_string()))?;
    request
        .validate()
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, &e.to_string()))?;
    Ok(request)
}

async fn scoped<T>(
    token: &CancellationToken,
    work: impl Future<Output = Result<T, TenantError>>,
) -> Result<T, TenantError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(TenantError::Cancelled),
        result = work => result,
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response {
    warp::reply::with_status(warp::reply::json(body), status).into_response()
}

pub fn error_response(status: StatusCode, message: &str) -> Response {
    json_response(status, &ErrorMessage { message: message.to_string() })
}

fn with_server(server: Arc<Server>) -> impl Filter<Extract = (Arc<Server>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || server.clone())
}

// GET and DELETE carry no body. Everything else must declare a length
// within the limit before the body is read.
fn body(limit: u64) -> impl Filter<Extract = (Bytes,), Error = Rejection> + Clone {
    let bodiless = warp::get().or(warp::delete()).unify().map(Bytes::new);
    let bounded = warp::body::content_length_limit(limit).and(warp::body::bytes());
    bodiless.or(bounded).unify()
}

async fn handle_rejection(err: Rejection) -> Result<Response, Rejection> {
    if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        Ok(error_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"))
    } else if err.find::<warp::reject::LengthRequired>().is_some() {
        Ok(error_response(StatusCode::LENGTH_REQUIRED, "content length required"))
    } else {
        Err(err)
    }
}

// Hands every request to the route table.
pub fn routes(server: Arc<Server>) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::method()
        .and(warp::path::full())
        .and(body(server.content_length_limit))
        .and(with_server(server))
        .and_then(|method: Method, path: FullPath, body: Bytes, server: Arc<Server>| async move {
            Ok::<Response, Rejection>(server.dispatch(&method, path.as_str(), &body).await)
        })
        .recover(handle_rejection)
        .unify()
}

pub async fn serve(address: SocketAddr, server: Arc<Server>, token: CancellationToken) -> Result<(), Error> {
    let http_log_wrapper = warp::log("whizard_adapter::web");
    let (bound, running) = warp::serve(routes(server).with(http_log_wrapper))
        .try_bind_with_graceful_shutdown(address, token.cancelled_owned())
        .map_err(|source| Error::Bind { address, source })?;
    info!("Starting the WebServer on {}", bound);
    running.await;
    Ok(())
}
