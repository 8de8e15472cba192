//! Prompt construction for the control loop.
//!
//! The system prompt pins the response contract (one JSON object with
//! `thought`, `action`, `action_args`) and the action vocabulary. Per-step
//! prompts carry the task, a bounded window of previous steps, and the
//! current element listing. Retry prompts restate the validation error so
//! the model can self-correct.

/// System role definition sent with every request
pub const SYSTEM_PROMPT: &str = r#"You are an agent operating an Android device to complete a high-level task.

--- CORE DIRECTIVE ---
Act like a human user. Base every decision exclusively on the screen content you are given: the screenshots and the numbered UI element list. Never answer from memory; navigate the device to find information instead.

--- INPUTS ---
Each step you receive:
1. The overall task description.
2. Screenshots of the previous and current screen (when vision is enabled).
3. A list of simplified UI elements on the current screen, identified by a numeric index.

--- OUTPUT FORMAT ---
Respond with a single valid JSON object and nothing else: no markdown fences, no commentary. The object has exactly three keys:
1. "thought": a brief reasoning step grounded in what is on screen.
2. "action": the name of the action to perform.
3. "action_args": an object with the action's arguments (use {} when there are none).

--- AVAILABLE ACTIONS ---
- "tap", args {"index": N}: tap the center of element N.
- "swipe", args {"index": N} or {"direction": "up"|"down"|"left"|"right"}: swipe from element N, or across the screen in a direction.
- "type_text", args {"index": N, "text": "..."}: focus element N and type the text.
- "back", args {}: press the system back button.
- "home", args {}: press the system home button.
- "wait", args {"seconds": S} (seconds optional): pause before observing again.
- "finish", args {"result": "..."}: use ONLY when the whole task is complete; summarize the outcome in "result".

--- FINAL REMINDER ---
Be precise and methodical. Reference only element indices that appear in the list. Your entire response must be one clean JSON object."#;

/// One prior step, summarized for the history window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub step: u32,
    pub thought: String,
    pub action: String,
}

/// Prompt for the first step of a run
pub fn first_step_prompt(task: &str, element_listing: &str) -> String {
    format!(
        "The user's overall task is: \"{}\"\n\n\
         This is the first step. Here is the current screen's UI layout:\n\
         --- UI ELEMENTS ---\n{}--- END UI ELEMENTS ---\n\n\
         Based on the screenshot and the UI elements, what is the first logical action to take to accomplish the task?",
        task, element_listing
    )
}

/// Prompt for every step after the first, carrying recent history
pub fn followup_prompt(task: &str, history: &[HistoryEntry], element_listing: &str) -> String {
    let mut recap = String::new();
    for entry in history {
        recap.push_str(&format!(
            "- step {}: thought \"{}\", action `{}`\n",
            entry.step, entry.thought, entry.action
        ));
    }
    format!(
        "The user's overall task is: \"{}\"\n\n\
         Your recent steps, oldest first:\n{}\n\
         You are now looking at the screen resulting from the last action. \
         When two screenshots are attached, the first shows the screen BEFORE that action and the second AFTER.\n\n\
         Here is the current screen's UI layout:\n\
         --- UI ELEMENTS ---\n{}--- END UI ELEMENTS ---\n\n\
         Analyze the result of your last action. Was it successful? What is the next logical action to take to continue the task?",
        task, recap, element_listing
    )
}

/// Suffix appended when the previous response failed validation
pub fn retry_suffix(error: &str) -> String {
    format!(
        "\n\n--- PREVIOUS RESPONSE REJECTED ---\n\
         Your previous response could not be used: {}.\n\
         Answer again with a single valid JSON object following the required format, \
         referencing only element indices from the list above.",
        error
    )
}
