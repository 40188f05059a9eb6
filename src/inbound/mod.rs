//! Inbound side: provider webhook parsing, canonical events and intake records.

pub mod event;
pub mod normalizer;
pub mod whatsapp;

pub use event::{
    EventKind, EventOutcome, EventPayload, InboundEvent, InboundEventRecord, IntakeOutcome,
};
pub use normalizer::{
    ConversationResolver, FormTokenCheck, Normalizer, WhatsAppConversations, check_form_token,
};
