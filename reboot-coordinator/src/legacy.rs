//! The legacy Container Linux auto-labeling task (spec §1, §4.7, §9). Its
//! heuristics are an external collaborator and explicitly out of scope for
//! this repository; this stub only provides the wiring point the
//! supervisor needs to run it alongside the reconciler on the same ticker.

/// One tick of the legacy labeler. Intentionally a no-op: the behavior it
/// would implement (detecting Container Linux nodes lacking the
/// distribution label and labeling them) is an out-of-scope collaborator.
pub async fn auto_label_tick() {}
