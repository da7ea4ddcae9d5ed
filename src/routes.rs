use std::convert::Infallible;
use std::sync::Arc;
use warp::{filters::BoxedFilter, Filter, Reply};

use revlens_core::error::handle_rejection;

use crate::cors::{self, CorsPolicy};
use crate::handlers::{self, AppContext};

/// Assemble the full route tree: liveness, preflight, and the `/api`
/// surface with its no-store marker, CORS decoration and error recovery.
pub fn routes(ctx: AppContext, policy: Arc<CorsPolicy>) -> BoxedFilter<(impl Reply,)> {
    let health = warp::path!("health").and(warp::get()).and_then(handlers::health);
    let ping = warp::path!("ping").and(warp::get()).and_then(handlers::ping);

    // multipart cap: the per-file limit is enforced while streaming; this
    // only bounds the request body as a whole
    let multipart_cap = ctx.max_file_size.saturating_mul(20);

    let submit = warp::path!("api" / "analysis")
        .and(warp::post())
        .and(warp::multipart::form().max_length(multipart_cap))
        .and(with_context(ctx.clone()))
        .and_then(handlers::submit_analysis);

    let list_reports = warp::path!("api" / "reports")
        .and(warp::get())
        .and(with_context(ctx.clone()))
        .and_then(handlers::list_reports);

    let get_messages = warp::path!("api" / "reports" / String / "messages")
        .and(warp::get())
        .and(with_context(ctx.clone()))
        .and_then(handlers::get_messages);

    let get_report = warp::path!("api" / "reports" / String)
        .and(warp::get())
        .and(with_context(ctx.clone()))
        .and_then(handlers::get_report);

    let delete_report = warp::path!("api" / "reports" / String)
        .and(warp::delete())
        .and(with_context(ctx))
        .and_then(handlers::delete_report);

    // every /api reply is marked non-cacheable
    let api = submit
        .or(list_reports)
        .or(get_messages)
        .or(get_report)
        .or(delete_report)
        .with(warp::reply::with::header("cache-control", "no-store"));

    let preflight = cors::preflight(Arc::clone(&policy));

    let decorating_policy = Arc::clone(&policy);
    health
        .or(ping)
        .or(preflight)
        .or(api)
        .recover(handle_rejection)
        .and(warp::header::optional::<String>("origin"))
        .map(move |reply: _, origin: Option<String>| {
            cors::decorate(reply, origin, &decorating_policy)
        })
        .with(warp::trace::request())
        .boxed()
}

/// Helper filter handing the shared context to handlers
fn with_context(
    ctx: AppContext,
) -> impl Filter<Extract = (AppContext,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}
