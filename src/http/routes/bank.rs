use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use super::{created, created_unless};
use crate::bank::{
    self, ApplyInput, AttachInput, AutoApplyInput, AutoApplyResult, BankRule, ImportInput,
    ImportResult, LineAction, LineFilter, NewRule, StatementLine,
};
use crate::http::extract::{Body, Ctx, Id, Params};
use crate::http::{ApiResult, AppState};
use crate::query::Page;
use crate::reconciler::{self, ReconcileInput, ReconcileResult};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/bank/imports", post(import))
        .route("/bank/lines", get(list_lines))
        .route("/bank/lines/:id/attach", post(attach))
        .route("/bank/lines/:id/apply", post(apply))
        .route("/bank/rules", get(list_rules).post(create_rule))
        .route("/bank/auto-apply", post(auto_apply))
        .route("/bank/reconciliations", post(reconcile))
}

async fn import(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Body(input): Body<ImportInput>,
) -> ApiResult<(StatusCode, Json<ImportResult>)> {
    let result = state
        .write(ctx, move |conn, ctx| bank::import_statement(conn, ctx, &input))
        .await?;
    Ok((created_unless(result.duplicate_file), Json(result)))
}

async fn list_lines(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Params(filter): Params<LineFilter>,
    Params(page): Params<Page>,
) -> ApiResult<Json<Vec<StatementLine>>> {
    state
        .read(ctx, move |conn, ctx| bank::list_lines(conn, ctx, &filter, page))
        .await
        .map(Json)
}

async fn attach(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Id(id): Id<i64>,
    Body(input): Body<AttachInput>,
) -> ApiResult<Json<LineAction>> {
    state.write(ctx, move |conn, ctx| bank::attach(conn, ctx, id, &input)).await.map(Json)
}

async fn apply(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Id(id): Id<i64>,
    Body(input): Body<ApplyInput>,
) -> ApiResult<Json<LineAction>> {
    state.write(ctx, move |conn, ctx| bank::apply(conn, ctx, id, &input)).await.map(Json)
}

#[derive(Deserialize)]
struct RuleQuery {
    legal_entity_id: Option<i64>,
}

async fn list_rules(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Params(query): Params<RuleQuery>,
) -> ApiResult<Json<Vec<BankRule>>> {
    state
        .read(ctx, move |conn, ctx| bank::list_rules(conn, ctx, query.legal_entity_id))
        .await
        .map(Json)
}

async fn create_rule(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Body(input): Body<NewRule>,
) -> ApiResult<(StatusCode, Json<BankRule>)> {
    state
        .write(ctx, move |conn, ctx| bank::create_rule(conn, ctx, &input))
        .await
        .map(created)
}

async fn auto_apply(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Body(input): Body<AutoApplyInput>,
) -> ApiResult<Json<AutoApplyResult>> {
    state
        .write(ctx, move |conn, ctx| bank::auto_apply(conn, ctx, &input))
        .await
        .map(Json)
}

async fn reconcile(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Body(input): Body<ReconcileInput>,
) -> ApiResult<(StatusCode, Json<ReconcileResult>)> {
    state
        .write(ctx, move |conn, ctx| reconciler::reconcile(conn, ctx, &input))
        .await
        .map(created)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::http::tests::{test_app, TestApp};

    const STATEMENT: &str = "Date,Description,Amount\n\
        03/03/2025,CLIENT PAYMENT ACME,\"1,200.00\"\n\
        03/05/2025,COFFEE ROASTERS,(45.50)\n";

    async fn import_statement(t: &TestApp) -> Value {
        let (status, body) = t
            .call(
                "POST",
                "/api/v1/bank/imports",
                Some(json!({
                    "legal_entity_id": t.fx.le_id,
                    "bank_account_id": t.fx.bank,
                    "filename": "march.csv",
                    "content": STATEMENT,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body
    }

    #[tokio::test]
    async fn test_import_then_duplicate_file() {
        let t = test_app();
        let first = import_statement(&t).await;
        assert_eq!(first["imported"], 2);

        let (status, again) = t
            .call(
                "POST",
                "/api/v1/bank/imports",
                Some(json!({
                    "legal_entity_id": t.fx.le_id,
                    "bank_account_id": t.fx.bank,
                    "filename": "march-copy.csv",
                    "content": STATEMENT,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(again["duplicate_file"], true);

        let (_, lines) = t.call("GET", "/api/v1/bank/lines?status=UNMATCHED", None).await;
        let lines = lines.as_array().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["amount"], -45.5);
    }

    #[tokio::test]
    async fn test_apply_line_and_reconcile() {
        let t = test_app();
        import_statement(&t).await;
        let (_, lines) = t.call("GET", "/api/v1/bank/lines", None).await;
        let deposit = lines[0]["id"].as_i64().unwrap();

        let apply = json!({
            "counter_account_id": t.fx.revenue,
            "book_id": t.fx.book_id,
            "idempotency_key": "bank-apply-1",
        });
        let uri = format!("/api/v1/bank/lines/{deposit}/apply");
        let (status, applied) = t.call("POST", &uri, Some(apply.clone())).await;
        assert_eq!(status, StatusCode::OK, "{applied}");
        assert_eq!(applied["line"]["status"], "APPLIED");
        let (_, replay) = t.call("POST", &uri, Some(apply)).await;
        assert_eq!(replay["idempotent_replay"], true);

        let (status, rec) = t
            .call(
                "POST",
                "/api/v1/bank/reconciliations",
                Some(json!({
                    "book_id": t.fx.book_id,
                    "bank_account_id": t.fx.bank,
                    "statement_date": "2025-03-31",
                    "statement_balance": 1200.0,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(rec["is_reconciled"], true);
        assert_eq!(rec["discrepancy"], 0.0);
    }

    #[tokio::test]
    async fn test_rule_auto_apply() {
        let t = test_app();
        import_statement(&t).await;
        let (status, _) = t
            .call(
                "POST",
                "/api/v1/bank/rules",
                Some(json!({
                    "legal_entity_id": t.fx.le_id,
                    "pattern": "coffee",
                    "counter_account_id": t.fx.expense,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, result) = t
            .call(
                "POST",
                "/api/v1/bank/auto-apply",
                Some(json!({ "legal_entity_id": t.fx.le_id, "book_id": t.fx.book_id })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{result}");
        assert_eq!(result["applied"], 1);
        assert_eq!(result["unmatched"], 1);

        let (_, rules) = t.call(
            "GET",
            &format!("/api/v1/bank/rules?legal_entity_id={}", t.fx.le_id),
            None,
        )
        .await;
        assert_eq!(rules[0]["hit_count"], 1);
    }

    #[tokio::test]
    async fn test_invalid_regex_rule_is_rejected() {
        let t = test_app();
        let (status, body) = t
            .call(
                "POST",
                "/api/v1/bank/rules",
                Some(json!({
                    "legal_entity_id": t.fx.le_id,
                    "pattern": "([unclosed",
                    "match_type": "regex",
                    "counter_account_id": t.fx.expense,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("Invalid regex"));
    }
}
