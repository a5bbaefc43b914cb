//! Opaque prompt bundles for profile extraction and consolidation.
//!
//! Each bundle pairs an *update* system prompt (turns one conversation message
//! plus the current profile into `add`/`delete` commands) with a
//! *consolidation* system prompt (rewrites an oversized profile section into
//! fewer entries).  The engine treats these as opaque strings; the bundle is
//! selected once at startup by name.

/// A pair of system prompts driving one profile domain.
///
/// The update prompt is split into a domain-specific introduction and the
/// shared command grammar; [`PromptBundle::update_prompt`] joins them.
#[derive(Debug, Clone, Copy)]
pub struct PromptBundle {
    pub name: &'static str,
    intro: &'static str,
    consolidation: &'static str,
}

impl PromptBundle {
    /// Full system prompt for the extraction (update) pass.
    pub fn update_prompt(&self) -> String {
        format!("{}{}", self.intro, UPDATE_COMMAND_RULES)
    }

    /// System prompt for the consolidation pass.
    pub fn consolidation_prompt(&self) -> &'static str {
        self.consolidation
    }
}

/// Look up a bundle by its configured name.  Returns `None` for unknown names;
/// callers surface that as an invalid-input error.
pub fn bundle(name: &str) -> Option<&'static PromptBundle> {
    match name {
        "general" | "profile" => Some(&GENERAL),
        "crm" => Some(&CRM),
        "financial" => Some(&FINANCIAL),
        "writing" => Some(&WRITING),
        _ => None,
    }
}

/// Names accepted by [`bundle`], for error messages and docs.
pub const BUNDLE_NAMES: &[&str] = &["general", "crm", "financial", "writing"];

const UPDATE_COMMAND_RULES: &str = r#"
The profile is a two-level key-value store: the outer key is a *tag* (a broad
category), the inner key is a *feature* (a short executive summary), and each
tag/feature pair holds one or more *values* (the detailed content).

Output a JSON object mapping arbitrary string keys to commands. Each command
is an object:
- {"command": "add", "tag": ..., "feature": ..., "value": ...} adds an entry.
  Optionally include "date" (an EDTF date string for when the fact was true)
  and "author" (who stated it).
- {"command": "delete", "tag": ..., "feature": ...} removes entries. Include
  "value" to remove one specific value; omit it to remove every value under
  that tag and feature.

Rules:
- Entries must be atomic: one discrete fact each, as short as possible without
  losing meaning.
- Infer facts that are implied but unstated, and note your uncertainty briefly
  in the value when you are unsure.
- Do not delete anything unless the message asks for it.
- Return the empty object {} when the message carries no profile-relevant
  information at all.
- First think inside <think> </think> tags, then output only valid JSON.
- Always use the flat command format with "command", "tag", "feature" and
  "value" keys. Never nest objects or invent other shapes.
"#;

const CONSOLIDATION_PROMPT: &str = r#"
You perform memory consolidation for a long-term profile store. The goal is
not merely fewer memories but less interference between them: strip away the
coupling each memory inherited from the conversation it came from.

You receive a JSON list of semantically similar memories. Each is an object
with four fields: "tag", "feature", "value", and "metadata" containing one
field "id" (an integer).

Output new consolidated memories as objects with "tag", "feature", "value",
and "metadata" containing one field "citations": the list of old memory ids
that fed into it. Also output the ids of old memories to keep as-is; memories
you neither keep nor cite are deleted.

Guidelines:
- Split memories that bundle unrelated ideas.
- Delete memories that are purely redundant.
- When memories differ only in detail, align their tags and features so the
  shared part lives in the feature and the varying part in the value.
- Do not invent new tag names.
- At least some information must be discarded; be more aggressive the more
  memories you receive.

The correct no-op syntax is:
{
    "consolidate_memories": [],
    "keep_memories": []
}

The final output schema is:
<think> your chain of thought here </think>
{
    "consolidate_memories": [new memories to add],
    "keep_memories": [ids of old memories to keep]
}
"#;

static GENERAL: PromptBundle = PromptBundle {
    name: "general",
    intro: r#"
You extract durable user-profile facts for a personalized chat assistant.
You receive the current profile and one message the user sent; update the
profile with everything the message reveals or implies about the user.

Extract all personal information, even basic facts such as name, age and
location - no personal detail is too small to record. Tags worth looking
for include: assistant response preferences, notable past conversation
topics, helpful user insights, communication style, learning preferences,
personal values, occupation and work preferences, demographic information,
geographic and cultural context, health and wellbeing, technical
proficiency, hobbies and interests, life goals and milestones, and
relationships and family context. Create new features freely, but do not
invent tags outside that list.
"#,
    consolidation: CONSOLIDATION_PROMPT,
};

static CRM: PromptBundle = PromptBundle {
    name: "crm",
    intro: r#"
You extract customer-relationship facts from sales conversations. You
receive the current account profile and one message; update the profile
with everything the message reveals about the account.

Use the account or company name as the tag. Features worth tracking
include: sales_stage, decision_makers, budget, timeline, pain_points,
competitors, objections, next_steps, and contract terms. Record who said
what via the "author" key when the speaker matters, and attach a "date"
when a fact is tied to a point in time.
"#,
    consolidation: CONSOLIDATION_PROMPT,
};

static FINANCIAL: PromptBundle = PromptBundle {
    name: "financial",
    intro: r#"
You extract facts about an investor from their conversations with a
financial-analysis assistant. You receive the current investor profile and
one message; update the profile with everything it reveals.

Tags worth looking for include: investments, risk_tolerance, financial
goals, income and liabilities, tax context, market views, and preferred
analysis formats. Keep quantitative facts exact; attach a "date" whenever
a figure is tied to a reporting period.
"#,
    consolidation: CONSOLIDATION_PROMPT,
};

static WRITING: PromptBundle = PromptBundle {
    name: "writing",
    intro: r#"
You extract facts about an author for a writing assistant. You receive
the current author profile and one message; update the profile with
everything it reveals about how this author writes and wants to be helped.

Use content types (essay, email, fiction, documentation) as tags. Features
worth tracking include: tone, register, structure preferences, vocabulary
habits, revision style, audiences written for, and recurring subjects.
"#,
    consolidation: CONSOLIDATION_PROMPT,
};
