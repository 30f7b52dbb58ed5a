use std::collections::HashMap;

use warp::http::Method;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Operation {
    CreateTenant,
    DeleteTenant,
    UpdateTenant,
    GetTenant,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::CreateTenant => "create",
            Operation::DeleteTenant => "delete",
            Operation::UpdateTenant => "update",
            Operation::GetTenant => "get",
        }
    }
}

// One entry of the route table. `{name}` segments in `path` capture a parameter.
#[derive(Clone, Debug)]
pub struct HandlerSpec {
    pub method: Method,
    pub path: &'static str,
    pub operation: Operation,
}

#[derive(PartialEq, Eq, Debug)]
pub enum Route {
    Matched {
        operation: Operation,
        params: HashMap<String, String>,
    },
    MethodNotAllowed,
    NotFound,
}

pub fn tenant_handlers() -> Vec<HandlerSpec> {
    vec![
        HandlerSpec { method: Method::POST, path: "/api/v1/tenants", operation: Operation::CreateTenant },
        HandlerSpec { method: Method::DELETE, path: "/api/v1/tenants/{tenant}", operation: Operation::DeleteTenant },
        HandlerSpec { method: Method::PUT, path: "/api/v1/tenants/{tenant}", operation: Operation::UpdateTenant },
        HandlerSpec { method: Method::GET, path: "/api/v1/tenants/{tenant}", operation: Operation::GetTenant },
    ]
}

// Every handler is reachable both as `path` and as `/v{version}` + `path`.
// The version is accepted but never inspected.
pub struct Router {
    handlers: Vec<HandlerSpec>,
}

impl Router {
    pub fn new(handlers: Vec<HandlerSpec>) -> Router {
        Router { handlers }
    }

    pub fn resolve(&self, method: &Method, path: &str) -> Route {
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        let unversioned = match segments.split_first() {
            Some((first, rest)) if is_version(first) => Some(rest),
            _ => None,
        };

        let mut path_matched = false;
        for handler in &self.handlers {
            let params = match_path(handler.path, &segments)
                .or_else(|| unversioned.and_then(|rest| match_path(handler.path, rest)));
            if let Some(params) = params {
                if handler.method == *method {
                    return Route::Matched { operation: handler.operation, params };
                }
                path_matched = true;
            }
        }

        if path_matched {
            Route::MethodNotAllowed
        } else {
            Route::NotFound
        }
    }
}

// "v" followed by digits and dots, e.g. v1 or v1.24.
fn is_version(segment: &str) -> bool {
    segment
        .strip_prefix('v')
        .map_or(false, |rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit() || c == '.'))
}

fn match_path(pattern: &str, segments: &[&str]) -> Option<HashMap<String, String>> {
    let expected: Vec<&str> = pattern.trim_start_matches('/').split('/').collect();
    if expected.len() != segments.len() {
        return None;
    }

    let mut params = HashMap::new();
    for (want, got) in expected.iter().zip(segments) {
        match want.strip_prefix('{').and_then(|w| w.strip_suffix('}')) {
            Some(name) if !got.is_empty() => {
                let value = urlencoding::decode(got).ok()?;
                params.insert(name.to_string(), value.into_owned());
            }
            Some(_) => return None,
            None if want == got => {}
            None => return None,
        }
    }
    Some(params)
}
