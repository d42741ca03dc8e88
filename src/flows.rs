//! Conversation graph: what the assistant is told to do at each point of a call and which
//! functions it may call there.

use crate::context::ConversationContext;
use crate::crm_client::CrmApi;
use crate::crm_types::{
    ClientAccommodationDto, CompactRentalDto, Language, RentalSettlementDetailsDto,
};
use crate::eligibility::{check_active_stay, check_settlement, Eligibility};
use crate::openai_types::{OpenAIFunctionDef, OpenAIMessage, OpenAITool};
use crate::tools;

use chrono::NaiveDateTime;
use serde::Serialize;
use std::fmt::Write;
use tracing::{debug, warn};

const ROLE_PROMPT: &str = "You are the phone assistant of a short-term rental company. \
Everything you say is converted to speech, so answer in short, natural sentences without \
lists, markdown, emoji or special characters. Never invent facts about bookings, prices or \
addresses; use only what you are given or what the functions return. If a function returns \
an error, apologise briefly and explain it in plain words.";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PostAction {
    /// Hang up once the node's reply has been spoken.
    EndConversation,
}

/// A function the model may call while a node is active.
#[derive(Clone, Debug)]
pub struct FunctionSchema {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: serde_json::Value,
}

impl FunctionSchema {
    pub fn to_tool(&self) -> OpenAITool {
        OpenAITool {
            kind: "function",
            function: OpenAIFunctionDef {
                name: self.name.to_string(),
                description: self.description.to_string(),
                parameters: self.parameters.clone(),
            },
        }
    }
}

#[derive(Clone, Debug)]
pub struct FlowNode {
    pub name: &'static str,
    pub role_messages: Vec<OpenAIMessage>,
    pub task_messages: Vec<OpenAIMessage>,
    pub functions: Vec<FunctionSchema>,
    pub post_actions: Vec<PostAction>,
}

impl FlowNode {
    fn new(name: &'static str, ctx: &ConversationContext, task: String) -> Self {
        Self {
            name,
            role_messages: vec![OpenAIMessage::system(role_prompt(ctx))],
            task_messages: vec![OpenAIMessage::system(task)],
            functions: vec![],
            post_actions: vec![],
        }
    }

    fn with_functions(mut self, functions: Vec<FunctionSchema>) -> Self {
        self.functions = functions;
        self
    }

    pub fn offers(&self, function: &str) -> bool {
        self.functions.iter().any(|f| f.name == function)
    }

    pub fn ends_conversation(&self) -> bool {
        self.post_actions.contains(&PostAction::EndConversation)
    }
}

fn role_prompt(ctx: &ConversationContext) -> String {
    let language = match ctx.language() {
        Language::Uk => "Speak Ukrainian for the whole call.",
        Language::En => "Speak English for the whole call. A caller who wants another language \
can save it with update_language; it applies from their next call.",
    };
    format!("{ROLE_PROMPT} {language}")
}

/// The caller's goal, as classified by the model.
#[derive(Serialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "kebab-case")]
pub enum Intent {
    Booking,
    Settlement,
    InfoOrEmergency,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Booking => "booking",
            Intent::Settlement => "settlement",
            Intent::InfoOrEmergency => "info-or-emergency",
        }
    }
}

/// Result of interpreting the model's free-text intent.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Route {
    Intent(Intent),
    Unrecognized(String),
}

impl Route {
    pub fn parse(raw: &str) -> Self {
        let normalized = raw
            .trim()
            .to_lowercase()
            .replace(['-', ' '], "_");
        let intent = if normalized.contains("emergenc") || normalized.starts_with("info") {
            Some(Intent::InfoOrEmergency)
        } else if normalized.contains("settle")
            || normalized.contains("check_in")
            || normalized.contains("checkin")
        {
            Some(Intent::Settlement)
        } else if normalized.contains("book") || normalized.contains("reserv") {
            Some(Intent::Booking)
        } else {
            None
        };
        match intent {
            Some(intent) => Route::Intent(intent),
            None => Route::Unrecognized(raw.to_string()),
        }
    }
}

/// First node of a call: greet known callers, ask unknown ones for their name.
pub fn initial_node(ctx: &ConversationContext) -> FlowNode {
    match &ctx.client {
        Some(_) => intent_node(ctx, true),
        None => new_caller_node(ctx),
    }
}

pub fn new_caller_node(ctx: &ConversationContext) -> FlowNode {
    let task = "Greet the caller warmly. Their phone number is not in our records, so ask for \
their first and last name. Once you have both, call record_full_name. Do not discuss anything \
else before the name is recorded."
        .to_string();
    FlowNode::new("new_caller", ctx, task).with_functions(vec![tools::record_full_name_schema()])
}

pub fn intent_node(ctx: &ConversationContext, greet: bool) -> FlowNode {
    let mut task = String::new();
    if greet {
        match &ctx.client {
            Some(client) => {
                let _ = write!(task, "Greet {} by first name. ", client.first_name);
            }
            None => task.push_str("Greet the caller. "),
        }
    }
    if let Some(accommodation) = &ctx.accommodation {
        let _ = write!(
            task,
            "The caller has a booking: {}. ",
            describe_accommodation(accommodation)
        );
    }
    task.push_str(
        "Find out what the caller needs. The possible intents are: 'booking' (renting a place \
for new dates), 'settlement' (checking in to a booked place today) and 'info-or-emergency' \
(questions or problems during a current stay). As soon as it is clear, call route_by_intent. \
If the caller wants to finish, call end_call.",
    );
    let mut functions = vec![tools::route_by_intent_schema()];
    if ctx.is_identified() {
        functions.push(tools::update_preferences_schema());
        functions.push(tools::update_language_schema());
    }
    functions.push(tools::end_call_schema());
    FlowNode::new("intent", ctx, task).with_functions(functions)
}

pub fn booking_node(
    ctx: &ConversationContext,
    rentals: &[CompactRentalDto],
    now: NaiveDateTime,
) -> FlowNode {
    let mut task = format!(
        "The caller wants to book a rental. Today is {}. ",
        now.format("%A, %d %B %Y")
    );
    if rentals.is_empty() {
        task.push_str(
            "Unfortunately there are no rentals available right now. Tell the caller and ask \
whether there is anything else you can do.",
        );
    } else {
        task.push_str("These are the rentals we offer:\n");
        for rental in rentals {
            let _ = writeln!(task, "- {}", describe_rental(rental));
        }
        task.push_str(
            "Help the caller choose one and agree on arrival and departure dates. Check the \
dates with get_available_dates before booking. When the caller confirms, call create_booking \
with dates in YYYY-MM-DD format. Never read out rental ids.",
        );
    }
    FlowNode::new("booking", ctx, task).with_functions(vec![
        tools::get_available_dates_schema(),
        tools::create_booking_schema(),
        tools::route_by_intent_schema(),
        tools::end_call_schema(),
    ])
}

pub fn settlement_node(
    ctx: &ConversationContext,
    details: &RentalSettlementDetailsDto,
) -> FlowNode {
    let mut task = String::from(
        "The caller is arriving today and may check in now. Guide them through the check-in \
instructions one step at a time, waiting for the caller to confirm each step before moving \
on. ",
    );
    if let Some(accommodation) = &ctx.accommodation {
        let _ = write!(task, "Booking: {}. ", describe_accommodation(accommodation));
    }
    let _ = write!(
        task,
        "Check-in instructions: {}\nWhen the caller says they are inside, call \
confirm_settlement.",
        details.settlement_details
    );
    FlowNode::new("settlement", ctx, task).with_functions(vec![
        tools::confirm_settlement_schema(),
        tools::route_by_intent_schema(),
        tools::end_call_schema(),
    ])
}

pub fn settlement_denied_node(ctx: &ConversationContext, eligibility: &Eligibility) -> FlowNode {
    let task = format!(
        "The caller wants to check in, but that is not possible right now. Reason: {} \
Explain this kindly and ask whether you can help with anything else.",
        eligibility.reason
    );
    FlowNode::new("settlement_denied", ctx, task).with_functions(vec![
        tools::route_by_intent_schema(),
        tools::end_call_schema(),
    ])
}

pub fn info_node(ctx: &ConversationContext, stay: &Eligibility) -> FlowNode {
    let mut functions = vec![];
    let mut task = String::new();
    if stay.allowed {
        task.push_str(
            "The caller is currently staying at one of our rentals and has a question or a \
problem. ",
        );
        if let Some(accommodation) = &ctx.accommodation {
            let _ = write!(task, "Booking: {}. ", describe_accommodation(accommodation));
        }
        task.push_str(
            "For emergencies (water, fire, gas, electricity, locked out, injuries) call \
get_emergency_instructions immediately and read the relevant part calmly. For questions about \
getting in or using the place call get_settlement_instructions. If someone is in danger, tell \
them to call 112 first.",
        );
        functions.push(tools::get_emergency_instructions_schema());
        functions.push(tools::get_settlement_instructions_schema());
    } else {
        let _ = write!(
            task,
            "The caller asked for help with a stay, but we cannot confirm they are staying with \
us right now. Reason: {} If someone is in danger, tell them to call 112. Otherwise offer \
help with a booking or a check-in.",
            stay.reason
        );
    }
    functions.push(tools::route_by_intent_schema());
    functions.push(tools::end_call_schema());
    FlowNode::new("info_or_emergency", ctx, task).with_functions(functions)
}

/// Shown when data needed for the next step could not be fetched.
pub fn unavailable_node(ctx: &ConversationContext, message: &str) -> FlowNode {
    let task = format!(
        "We could not load the information needed to continue ({message}). Apologise, say \
that a manager will follow up, and ask whether there is anything else."
    );
    FlowNode::new("unavailable", ctx, task).with_functions(vec![
        tools::route_by_intent_schema(),
        tools::end_call_schema(),
    ])
}

pub fn end_node(ctx: &ConversationContext) -> FlowNode {
    let task = "Thank the caller and say goodbye in one short sentence.".to_string();
    let mut node = FlowNode::new("end", ctx, task);
    node.post_actions.push(PostAction::EndConversation);
    node
}

fn describe_rental(rental: &CompactRentalDto) -> String {
    let mut out = format!(
        "id {}: {} at {}, {:.0} {} per night",
        rental.id,
        rental.description,
        rental.location,
        rental.price.amount(),
        rental.price.currency_code
    );
    if !rental.amenities.is_empty() {
        let amenities = rental
            .amenities
            .iter()
            .map(|a| a.title.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let _ = write!(out, "; amenities: {amenities}");
    }
    out
}

fn describe_accommodation(accommodation: &ClientAccommodationDto) -> String {
    let day = |d: Option<crate::crm_types::DateDayDto>| {
        d.and_then(|d| d.to_naive_date())
            .map(|d| d.format("%d %B %Y").to_string())
            .unwrap_or_else(|| "unknown".to_string())
    };
    let place = accommodation
        .rental
        .as_ref()
        .map(|r| format!("{} at {}", r.description, r.location))
        .unwrap_or_else(|| "rental".to_string());
    format!(
        "{place}, from {} to {}, status {}",
        day(accommodation.start_date),
        day(accommodation.end_date),
        accommodation.status
    )
}

/// Pick the next node for the caller's intent, fetching whatever that node needs.
pub async fn route_intent(
    raw_intent: &str,
    ctx: &mut ConversationContext,
    crm: &dyn CrmApi,
    now: NaiveDateTime,
) -> FlowNode {
    let intent = match Route::parse(raw_intent) {
        Route::Intent(intent) => intent,
        Route::Unrecognized(raw) => {
            warn!(intent=%raw, "unrecognized intent; asking again");
            return intent_node(ctx, false);
        }
    };
    debug!(intent=?intent, "routing call");
    ctx.intent = Some(intent);
    match intent {
        Intent::Booking => match crm.get_rentals().await {
            Ok(rentals) => booking_node(ctx, &rentals, now),
            Err(e) => unavailable_node(ctx, &e.user_message()),
        },
        Intent::Settlement => {
            let eligibility = check_settlement(ctx.accommodation.as_ref(), now);
            if !eligibility.allowed {
                return settlement_denied_node(ctx, &eligibility);
            }
            let rental_id = ctx
                .accommodation
                .as_ref()
                .and_then(|a| a.rental_id.clone());
            let Some(rental_id) = rental_id else {
                return unavailable_node(ctx, "the booking is not linked to a rental");
            };
            match crm.get_rental_settlement_details(&rental_id).await {
                Ok(details) => settlement_node(ctx, &details),
                Err(e) => unavailable_node(ctx, &e.user_message()),
            }
        }
        Intent::InfoOrEmergency => {
            let stay = check_active_stay(ctx.accommodation.as_ref(), now);
            info_node(ctx, &stay)
        }
    }
}
