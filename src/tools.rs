//! Functions the model can call, their JSON schemas, and their handlers.
//!
//! Handlers never fail: CRM problems come back to the model as `{"status": "error", ...}` so it
//! can explain them to the caller.

use crate::context::ConversationContext;
use crate::crm_client::CrmApi;
use crate::crm_types::{parse_day, BookRentalDto, CreateClientDto, Language, UpdateClientNameDto};
use crate::eligibility::{check_active_stay, check_settlement};
use crate::flows::{self, FlowNode, FunctionSchema};

use chrono::NaiveDateTime;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

/// A parsed function call from the model.
#[derive(Deserialize, Clone, PartialEq, Debug)]
#[serde(tag = "name", content = "arguments", rename_all = "snake_case")]
pub enum ToolCall {
    RecordFullName {
        first_name: String,
        last_name: String,
        #[serde(default)]
        middle_name: Option<String>,
    },
    RouteByIntent {
        intent: String,
    },
    GetAvailableDates {
        rental_id: String,
        start_date: String,
        end_date: String,
    },
    CreateBooking {
        rental_id: String,
        start_date: String,
        end_date: String,
    },
    ConfirmSettlement {},
    GetSettlementInstructions {},
    GetEmergencyInstructions {},
    UpdatePreferences {
        preferences: Vec<String>,
    },
    UpdateLanguage {
        language: String,
    },
    EndCall {},
}

impl ToolCall {
    /// `arguments` is the JSON text produced by the model; empty or `null` means no arguments.
    pub fn parse(name: &str, arguments: &str) -> Result<Self, String> {
        let arguments: Value = if arguments.trim().is_empty() {
            json!({})
        } else {
            match serde_json::from_str(arguments)
                .map_err(|e| format!("arguments for {name} are not valid JSON: {e}"))?
            {
                Value::Null => json!({}),
                arguments => arguments,
            }
        };
        serde_json::from_value(json!({ "name": name, "arguments": arguments }))
            .map_err(|e| format!("cannot call {name}: {e}"))
    }
}

/// What a handler hands back: the payload for the model and, optionally, the next node.
#[derive(Debug)]
pub struct ToolOutcome {
    pub result: Value,
    pub next_node: Option<FlowNode>,
}

impl ToolOutcome {
    fn success(result: Value) -> Self {
        Self {
            result,
            next_node: None,
        }
    }

    fn transition(result: Value, node: FlowNode) -> Self {
        Self {
            result,
            next_node: Some(node),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            result: json!({ "status": "error", "message": message.into() }),
            next_node: None,
        }
    }
}

pub async fn handle(
    call: ToolCall,
    ctx: &mut ConversationContext,
    crm: &dyn CrmApi,
    now: NaiveDateTime,
) -> ToolOutcome {
    info!(call=?call, "handling tool call");
    match call {
        ToolCall::RecordFullName {
            first_name,
            last_name,
            middle_name,
        } => record_full_name(ctx, crm, first_name, last_name, middle_name).await,
        ToolCall::RouteByIntent { intent } => {
            let node = flows::route_intent(&intent, ctx, crm, now).await;
            let routed = ctx.intent.map(|i| i.as_str()).unwrap_or("unrecognized");
            ToolOutcome::transition(json!({ "status": "success", "intent": routed }), node)
        }
        ToolCall::GetAvailableDates {
            rental_id,
            start_date,
            end_date,
        } => get_available_dates(crm, &rental_id, &start_date, &end_date).await,
        ToolCall::CreateBooking {
            rental_id,
            start_date,
            end_date,
        } => create_booking(ctx, crm, &rental_id, &start_date, &end_date, now).await,
        ToolCall::ConfirmSettlement {} => confirm_settlement(ctx, crm, now).await,
        ToolCall::GetSettlementInstructions {} => settlement_instructions(ctx, crm, now).await,
        ToolCall::GetEmergencyInstructions {} => emergency_instructions(ctx, crm, now).await,
        ToolCall::UpdatePreferences { preferences } => {
            let Some(client_id) = ctx.client_id().map(str::to_string) else {
                return ToolOutcome::error("The caller is not identified yet.");
            };
            match crm
                .update_client_preferences(&client_id, preferences.clone())
                .await
            {
                Ok(()) => {
                    if let Some(client) = ctx.client.as_mut() {
                        client.preferences = preferences;
                    }
                    ToolOutcome::success(json!({ "status": "success" }))
                }
                Err(e) => ToolOutcome::error(e.user_message()),
            }
        }
        ToolCall::UpdateLanguage { language } => {
            let Some(language) = Language::parse_lenient(&language) else {
                return ToolOutcome::error("Only English and Ukrainian are supported.");
            };
            let Some(client_id) = ctx.client_id().map(str::to_string) else {
                return ToolOutcome::error("The caller is not identified yet.");
            };
            match crm
                .update_client_preferred_language(&client_id, language)
                .await
            {
                Ok(()) => {
                    if let Some(client) = ctx.client.as_mut() {
                        client.preferred_language = Some(language);
                    }
                    ToolOutcome::success(json!({
                        "status": "success",
                        "message": "Saved. It applies from the next call; this call continues in the current language.",
                    }))
                }
                Err(e) => ToolOutcome::error(e.user_message()),
            }
        }
        ToolCall::EndCall {} => {
            ToolOutcome::transition(json!({ "status": "success" }), flows::end_node(ctx))
        }
    }
}

async fn record_full_name(
    ctx: &mut ConversationContext,
    crm: &dyn CrmApi,
    first_name: String,
    last_name: String,
    middle_name: Option<String>,
) -> ToolOutcome {
    let first_name = first_name.trim().to_string();
    let last_name = last_name.trim().to_string();
    if first_name.is_empty() || last_name.is_empty() {
        return ToolOutcome::error("Both first and last name are needed.");
    }
    let middle_name = middle_name
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty());

    match ctx.client.clone() {
        Some(mut client) => {
            let dto = UpdateClientNameDto {
                first_name: first_name.clone(),
                last_name: last_name.clone(),
                middle_name: middle_name.clone(),
            };
            if let Err(e) = crm.update_client_name(&client.id, &dto).await {
                return ToolOutcome::error(e.user_message());
            }
            client.first_name = first_name;
            client.last_name = last_name;
            client.middle_name = middle_name;
            ctx.client = Some(client);
        }
        None => {
            let dto = CreateClientDto {
                first_name,
                last_name,
                middle_name,
                phone_number: ctx.phone_number.clone(),
            };
            match crm.create_client(&dto).await {
                Ok(client) => {
                    info!(client_id=%client.id, "created client");
                    ctx.client = Some(client);
                }
                Err(e) => return ToolOutcome::error(e.user_message()),
            }
        }
    }
    let client_id = ctx.client_id().unwrap_or_default().to_string();
    ToolOutcome::transition(
        json!({ "status": "success", "client_id": client_id }),
        flows::intent_node(ctx, false),
    )
}

async fn get_available_dates(
    crm: &dyn CrmApi,
    rental_id: &str,
    start_date: &str,
    end_date: &str,
) -> ToolOutcome {
    let (Some(start), Some(end)) = (parse_day(start_date), parse_day(end_date)) else {
        return ToolOutcome::error("Dates must be given as YYYY-MM-DD.");
    };
    if start >= end {
        return ToolOutcome::error("The start date must be before the end date.");
    }
    match crm.get_rental_available_dates(rental_id, start, end).await {
        Ok(spans) => ToolOutcome::success(json!({
            "status": "success",
            "rental_id": spans.rental_id,
            "available_spans": spans.available_spans,
        })),
        Err(e) => ToolOutcome::error(e.user_message()),
    }
}

async fn create_booking(
    ctx: &mut ConversationContext,
    crm: &dyn CrmApi,
    rental_id: &str,
    start_date: &str,
    end_date: &str,
    now: NaiveDateTime,
) -> ToolOutcome {
    let Some(client_id) = ctx.client_id().map(str::to_string) else {
        return ToolOutcome::error("The caller must be identified before booking.");
    };
    let (Some(start), Some(end)) = (parse_day(start_date), parse_day(end_date)) else {
        return ToolOutcome::error("Dates must be given as YYYY-MM-DD.");
    };
    if start >= end {
        return ToolOutcome::error("The departure date must be after the arrival date.");
    }
    if start < now.date() {
        return ToolOutcome::error("The arrival date is in the past.");
    }
    let dto = BookRentalDto {
        rental_id: rental_id.to_string(),
        client_id: client_id.clone(),
        start_date: start.into(),
        end_date: end.into(),
    };
    if let Err(e) = crm.create_booking(&dto).await {
        return ToolOutcome::error(e.user_message());
    }
    info!(client_id=%client_id, rental_id=%rental_id, %start, %end, "booking created");
    // the new booking becomes the caller's current accommodation
    match crm.get_current_accommodation(&client_id).await {
        Ok(accommodation) => ctx.accommodation = accommodation,
        Err(e) => warn!(error=%e, "failed to refresh accommodation after booking"),
    }
    ToolOutcome::success(json!({
        "status": "success",
        "message": "Booking request created; a manager will confirm it.",
        "rental_id": rental_id,
        "start_date": start.format("%Y-%m-%d").to_string(),
        "end_date": end.format("%Y-%m-%d").to_string(),
    }))
}

async fn confirm_settlement(
    ctx: &mut ConversationContext,
    crm: &dyn CrmApi,
    now: NaiveDateTime,
) -> ToolOutcome {
    let eligibility = check_settlement(ctx.accommodation.as_ref(), now);
    if !eligibility.allowed {
        return ToolOutcome::error(eligibility.reason);
    }
    let Some(accommodation) = ctx.accommodation.as_mut() else {
        return ToolOutcome::error("No booking was found for this caller.");
    };
    match crm.confirm_settlement(&accommodation.id).await {
        Ok(()) => {
            info!(accommodation_id=%accommodation.id, "settlement confirmed");
            accommodation.status = "settled".to_string();
            ToolOutcome::success(json!({ "status": "success" }))
        }
        Err(e) => ToolOutcome::error(e.user_message()),
    }
}

async fn settlement_instructions(
    ctx: &ConversationContext,
    crm: &dyn CrmApi,
    now: NaiveDateTime,
) -> ToolOutcome {
    let accommodation = ctx.accommodation.as_ref();
    let stay = check_active_stay(accommodation, now);
    if !stay.allowed && !check_settlement(accommodation, now).allowed {
        return ToolOutcome::error(stay.reason);
    }
    let Some(rental_id) = accommodation.and_then(|a| a.rental_id.as_deref()) else {
        return ToolOutcome::error("The booking is not linked to a rental.");
    };
    match crm.get_rental_settlement_details(rental_id).await {
        Ok(details) => ToolOutcome::success(json!({
            "status": "success",
            "settlement_details": details.settlement_details,
        })),
        Err(e) => ToolOutcome::error(e.user_message()),
    }
}

async fn emergency_instructions(
    ctx: &ConversationContext,
    crm: &dyn CrmApi,
    now: NaiveDateTime,
) -> ToolOutcome {
    let accommodation = ctx.accommodation.as_ref();
    let stay = check_active_stay(accommodation, now);
    if !stay.allowed {
        return ToolOutcome::error(stay.reason);
    }
    let Some(rental_id) = accommodation.and_then(|a| a.rental_id.as_deref()) else {
        return ToolOutcome::error("The booking is not linked to a rental.");
    };
    match crm.get_rental_emergency_details(rental_id).await {
        Ok(details) => ToolOutcome::success(json!({
            "status": "success",
            "emergency_details": details.emergency_details,
        })),
        Err(e) => ToolOutcome::error(e.user_message()),
    }
}

fn schema(name: &'static str, description: &'static str, parameters: Value) -> FunctionSchema {
    FunctionSchema {
        name,
        description,
        parameters,
    }
}

fn no_parameters() -> Value {
    json!({ "type": "object", "properties": {} })
}

pub fn record_full_name_schema() -> FunctionSchema {
    schema(
        "record_full_name",
        "Record the caller's full name.",
        json!({
            "type": "object",
            "properties": {
                "first_name": { "type": "string" },
                "last_name": { "type": "string" },
                "middle_name": { "type": "string", "description": "Patronymic, if given" }
            },
            "required": ["first_name", "last_name"]
        }),
    )
}

pub fn route_by_intent_schema() -> FunctionSchema {
    schema(
        "route_by_intent",
        "Continue the call according to what the caller wants.",
        json!({
            "type": "object",
            "properties": {
                "intent": {
                    "type": "string",
                    "enum": ["booking", "settlement", "info-or-emergency"]
                }
            },
            "required": ["intent"]
        }),
    )
}

pub fn get_available_dates_schema() -> FunctionSchema {
    schema(
        "get_available_dates",
        "Get the free date ranges of a rental within a period.",
        json!({
            "type": "object",
            "properties": {
                "rental_id": { "type": "string" },
                "start_date": { "type": "string", "description": "YYYY-MM-DD" },
                "end_date": { "type": "string", "description": "YYYY-MM-DD" }
            },
            "required": ["rental_id", "start_date", "end_date"]
        }),
    )
}

pub fn create_booking_schema() -> FunctionSchema {
    schema(
        "create_booking",
        "Book a rental for the caller once they have confirmed the rental and the dates.",
        json!({
            "type": "object",
            "properties": {
                "rental_id": { "type": "string" },
                "start_date": { "type": "string", "description": "Arrival day, YYYY-MM-DD" },
                "end_date": { "type": "string", "description": "Departure day, YYYY-MM-DD" }
            },
            "required": ["rental_id", "start_date", "end_date"]
        }),
    )
}

pub fn confirm_settlement_schema() -> FunctionSchema {
    schema(
        "confirm_settlement",
        "Mark the caller as checked in once they are inside the rental.",
        no_parameters(),
    )
}

pub fn get_settlement_instructions_schema() -> FunctionSchema {
    schema(
        "get_settlement_instructions",
        "Get the check-in and house instructions of the caller's rental.",
        no_parameters(),
    )
}

pub fn get_emergency_instructions_schema() -> FunctionSchema {
    schema(
        "get_emergency_instructions",
        "Get the emergency instructions and contacts of the caller's rental.",
        no_parameters(),
    )
}

pub fn update_preferences_schema() -> FunctionSchema {
    schema(
        "update_preferences",
        "Save the caller's stated preferences (for example 'quiet area', 'needs parking').",
        json!({
            "type": "object",
            "properties": {
                "preferences": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["preferences"]
        }),
    )
}

pub fn update_language_schema() -> FunctionSchema {
    schema(
        "update_language",
        "Save the language the caller prefers to be served in on future calls.",
        json!({
            "type": "object",
            "properties": {
                "language": { "type": "string", "enum": ["EN", "UK"] }
            },
            "required": ["language"]
        }),
    )
}

pub fn end_call_schema() -> FunctionSchema {
    schema(
        "end_call",
        "End the call when the caller has nothing else to discuss.",
        no_parameters(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm_client::testing::{sample_accommodation, sample_client, FakeCrm};
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn known_ctx(status: &str) -> ConversationContext {
        let mut ctx = ConversationContext::new("+380501112233");
        ctx.client = Some(sample_client());
        ctx.accommodation = Some(sample_accommodation(status));
        ctx
    }

    #[test]
    fn parse_known_calls() {
        assert_eq!(
            ToolCall::parse("route_by_intent", r#"{"intent":"booking"}"#),
            Ok(ToolCall::RouteByIntent {
                intent: "booking".into()
            })
        );
        assert_eq!(ToolCall::parse("end_call", ""), Ok(ToolCall::EndCall {}));
        assert_eq!(ToolCall::parse("end_call", "null"), Ok(ToolCall::EndCall {}));
        assert!(ToolCall::parse("route_by_intent", "null").is_err());
        assert_eq!(
            ToolCall::parse("confirm_settlement", "{}"),
            Ok(ToolCall::ConfirmSettlement {})
        );
    }

    #[test]
    fn parse_rejects_unknown_and_malformed() {
        assert!(ToolCall::parse("order_pizza", "{}").is_err());
        assert!(ToolCall::parse("record_full_name", r#"{"first_name":"Olena"}"#).is_err());
        assert!(ToolCall::parse("route_by_intent", "{not json").is_err());
    }

    #[test]
    fn every_schema_name_parses() {
        let sample_args = [
            (record_full_name_schema(), r#"{"first_name":"a","last_name":"b"}"#),
            (route_by_intent_schema(), r#"{"intent":"booking"}"#),
            (
                get_available_dates_schema(),
                r#"{"rental_id":"r","start_date":"2025-01-01","end_date":"2025-01-02"}"#,
            ),
            (
                create_booking_schema(),
                r#"{"rental_id":"r","start_date":"2025-01-01","end_date":"2025-01-02"}"#,
            ),
            (confirm_settlement_schema(), "{}"),
            (get_settlement_instructions_schema(), "{}"),
            (get_emergency_instructions_schema(), "{}"),
            (update_preferences_schema(), r#"{"preferences":["quiet"]}"#),
            (update_language_schema(), r#"{"language":"UK"}"#),
            (end_call_schema(), "{}"),
        ];
        for (schema, args) in sample_args {
            assert!(
                ToolCall::parse(schema.name, args).is_ok(),
                "{} should parse",
                schema.name
            );
        }
    }

    #[tokio::test]
    async fn record_full_name_creates_unknown_client() {
        let crm = FakeCrm::default();
        let mut ctx = ConversationContext::new("+10000000000");
        let call = ToolCall::RecordFullName {
            first_name: " Taras ".into(),
            last_name: "Bondar".into(),
            middle_name: Some("".into()),
        };
        let outcome = handle(call, &mut ctx, &crm, at(2025, 5, 1, 10)).await;
        assert_eq!(outcome.result["status"], "success");
        assert_eq!(outcome.next_node.unwrap().name, "intent");
        let client = ctx.client.unwrap();
        assert_eq!(client.first_name, "Taras");
        assert_eq!(client.phone_number, "+10000000000");
        assert_eq!(client.middle_name, None);
    }

    #[tokio::test]
    async fn record_full_name_renames_known_client() {
        let crm = FakeCrm::default();
        let mut ctx = known_ctx("booking_confirmed");
        let call = ToolCall::RecordFullName {
            first_name: "Olena".into(),
            last_name: "Koval".into(),
            middle_name: None,
        };
        let outcome = handle(call, &mut ctx, &crm, at(2025, 5, 1, 10)).await;
        assert_eq!(outcome.result["status"], "success");
        assert_eq!(ctx.client.unwrap().last_name, "Koval");
        assert_eq!(crm.renamed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn route_by_intent_transitions() {
        let crm = FakeCrm::default();
        let mut ctx = known_ctx("booking_confirmed");
        let call = ToolCall::RouteByIntent {
            intent: "booking".into(),
        };
        let outcome = handle(call, &mut ctx, &crm, at(2025, 5, 1, 10)).await;
        assert_eq!(outcome.result["intent"], "booking");
        assert_eq!(outcome.next_node.unwrap().name, "booking");
    }

    #[tokio::test]
    async fn create_booking_validates_before_calling_crm() {
        let crm = FakeCrm::default();
        let now = at(2025, 5, 1, 10);

        let mut anonymous = ConversationContext::new("+10000000000");
        let call = ToolCall::CreateBooking {
            rental_id: "r-1".into(),
            start_date: "2025-06-01".into(),
            end_date: "2025-06-05".into(),
        };
        let outcome = handle(call.clone(), &mut anonymous, &crm, now).await;
        assert_eq!(outcome.result["status"], "error");

        let mut ctx = known_ctx("booking_confirmed");
        let backwards = ToolCall::CreateBooking {
            rental_id: "r-1".into(),
            start_date: "2025-06-05".into(),
            end_date: "2025-06-01".into(),
        };
        let outcome = handle(backwards, &mut ctx, &crm, now).await;
        assert_eq!(outcome.result["status"], "error");

        let past = ToolCall::CreateBooking {
            rental_id: "r-1".into(),
            start_date: "2025-04-01".into(),
            end_date: "2025-04-05".into(),
        };
        let outcome = handle(past, &mut ctx, &crm, now).await;
        assert_eq!(outcome.result["status"], "error");
        assert!(crm.bookings.lock().unwrap().is_empty());

        let outcome = handle(call, &mut ctx, &crm, now).await;
        assert_eq!(outcome.result["status"], "success");
        let bookings = crm.bookings.lock().unwrap();
        assert_eq!(bookings.len(), 1);
        assert_eq!(bookings[0].start_date.month, 6);
        assert_eq!(bookings[0].client_id, "c-1");
    }

    #[tokio::test]
    async fn crm_failure_becomes_error_result() {
        let crm = FakeCrm {
            fail_bookings: true,
            ..Default::default()
        };
        let mut ctx = known_ctx("booking_confirmed");
        let call = ToolCall::CreateBooking {
            rental_id: "r-1".into(),
            start_date: "2025-06-01".into(),
            end_date: "2025-06-05".into(),
        };
        let outcome = handle(call, &mut ctx, &crm, at(2025, 5, 1, 10)).await;
        assert_eq!(outcome.result["status"], "error");
        assert_eq!(outcome.result["message"], "Rental is not available");
    }

    #[tokio::test]
    async fn confirm_settlement_is_gated() {
        let crm = FakeCrm::default();
        let mut ctx = known_ctx("booking_confirmed");

        let outcome = handle(ToolCall::ConfirmSettlement {}, &mut ctx, &crm, at(2025, 5, 1, 11)).await;
        assert_eq!(outcome.result["status"], "error");
        assert!(crm.settled.lock().unwrap().is_empty());

        let outcome = handle(ToolCall::ConfirmSettlement {}, &mut ctx, &crm, at(2025, 5, 1, 13)).await;
        assert_eq!(outcome.result["status"], "success");
        assert_eq!(crm.settled.lock().unwrap().as_slice(), ["acc-1".to_string()]);
        assert_eq!(ctx.accommodation.unwrap().status, "settled");
    }

    #[tokio::test]
    async fn emergency_instructions_need_active_stay() {
        let crm = FakeCrm::default();
        let mut ctx = known_ctx("booking_confirmed");
        let outcome = handle(
            ToolCall::GetEmergencyInstructions {},
            &mut ctx,
            &crm,
            at(2025, 5, 3, 22),
        )
        .await;
        assert_eq!(outcome.result["status"], "error");

        let mut ctx = known_ctx("settled");
        let outcome = handle(
            ToolCall::GetEmergencyInstructions {},
            &mut ctx,
            &crm,
            at(2025, 5, 3, 22),
        )
        .await;
        assert_eq!(outcome.result["status"], "success");
        assert!(outcome.result["emergency_details"]
            .as_str()
            .unwrap()
            .contains("water valve"));
    }

    #[tokio::test]
    async fn update_language_rejects_unsupported() {
        let crm = FakeCrm::default();
        let mut ctx = known_ctx("settled");
        let outcome = handle(
            ToolCall::UpdateLanguage {
                language: "French".into(),
            },
            &mut ctx,
            &crm,
            at(2025, 5, 3, 22),
        )
        .await;
        assert_eq!(outcome.result["status"], "error");

        let outcome = handle(
            ToolCall::UpdateLanguage {
                language: "uk".into(),
            },
            &mut ctx,
            &crm,
            at(2025, 5, 3, 22),
        )
        .await;
        assert_eq!(outcome.result["status"], "success");
        assert_eq!(ctx.language(), Language::En);
        assert_eq!(
            ctx.client.unwrap().preferred_language,
            Some(Language::Uk)
        );
    }

    #[tokio::test]
    async fn end_call_moves_to_end_node() {
        let crm = FakeCrm::default();
        let mut ctx = ConversationContext::new("+1");
        let outcome = handle(ToolCall::EndCall {}, &mut ctx, &crm, at(2025, 5, 3, 22)).await;
        assert!(outcome.next_node.unwrap().ends_conversation());
    }
}
