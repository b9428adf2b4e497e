use crate::store::models::JobKind;

/// ワークフロー内で一度だけ作成される Job Record の冪等キー。
///
/// 同じワークフロー実行のリトライや再開時に、同一レコードを再利用するために使う。
pub(crate) fn idempotency_key(workflow_id: &str, kind: JobKind) -> String {
    format!("{workflow_id}:{}", kind.as_ref())
}
