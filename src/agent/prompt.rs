//! Default prompts and follow-up instructions

/// System prompt for the function-calling backend
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a helpful assistant with access to a persistent code execution kernel.

Use the execute_code tool whenever you need to:
- Calculate something
- Inspect or transform files in the working directory
- Produce plots or other output files
- Verify a result

Guidelines:
- Always run code to verify results rather than guessing
- The kernel keeps variables and imports between calls
- If code fails, read the traceback and fix it
- Supported languages: python, bash
- Use show_sample_code when the user only wants to see how something is done
- When the task is complete, respond with your final answer in plain text"#;

/// System prompt for backends that answer with a JSON object
pub const JSON_SYSTEM_PROMPT: &str = r#"You are a helpful assistant with access to a persistent code execution kernel.

Answer every turn with exactly one JSON object:
- To run code: {"explanation": "...", "action": "execute_code", "language": "python" or "bash", "code": "...", "saved_filenames": [...]}
- To show code without running it: {"explanation": "...", "action": "show_sample_code", "language": "...", "code": "...", "saved_filenames": []}
- To finish: {"explanation": "<your final answer>", "action": "final_answer"}

The kernel keeps variables and imports between calls. If code fails, read the traceback and fix it."#;

/// Follow-up after an execution that raised
pub const FIX_ERROR_PROMPT: &str =
    "The code raised an error. Read the traceback above, fix the problem and run the corrected code.";

/// Follow-up after an execution that succeeded
pub const CONTINUE_PROMPT: &str =
    "If this completes the task, summarize the result for the user. Otherwise continue with the next step.";

/// The follow-up instruction for an execution outcome
pub fn follow_up(has_error: bool) -> &'static str {
    if has_error {
        FIX_ERROR_PROMPT
    } else {
        CONTINUE_PROMPT
    }
}
