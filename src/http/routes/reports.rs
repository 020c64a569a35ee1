use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use crate::http::extract::{Ctx, Params};
use crate::http::{ApiResult, AppState};
use crate::trial_balance::{self, TrialBalance, TrialBalanceQuery};

pub fn router() -> Router<AppState> {
    Router::new().route("/reports/trial-balance", get(trial_balance))
}

async fn trial_balance(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Params(query): Params<TrialBalanceQuery>,
) -> ApiResult<Json<TrialBalance>> {
    state
        .read(ctx, move |conn, ctx| trial_balance::report(conn, ctx, &query))
        .await
        .map(Json)
}
