use crate::transcribe::CommandInput;
use shared::SceneContext;

pub const ERROR_MARKER: &str = "# Error:";
pub const ERROR_MARKER_LINE: &str = "# Error: Command cannot be processed.";

/// Why a prompt is being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptReason<'a> {
    Initial,
    /// The previously delivered script raised an error in the host.
    ExecutionFailed { category: &'a str, detail: &'a str },
    /// The previous attempt produced no usable script.
    NothingUsable,
}

const INSTRUCTIONS: &str = "**Instructions:**
1.  **Output Python Code Only:** Your response must contain ONLY the Python script. Do not include ```python, explanations, introductions, or any other text.
2.  **Use Blender 4.x API:** Ensure the script uses `bpy` commands compatible with Blender 4.x.
3.  **Prioritize `bpy.data`:** Whenever possible, use the `bpy.data` API for creating/manipulating objects, meshes, materials, etc. It is more robust than `bpy.ops` when run from scripts. Only use `bpy.ops` if `bpy.data` is not suitable for the specific task.
4.  **Handle Errors:** If the command is unclear, too complex to translate reliably, or potentially unsafe, output ONLY the following line:";

pub fn build(command: &CommandInput, context: &SceneContext, reason: PromptReason<'_>) -> String {
    let mut prompt = String::from("You are a Blender 4.x Python script generator.\n");

    match command {
        CommandInput::Text(_) => prompt.push_str(
            "Translate the following command into a `bpy` Python script compatible with Blender 4.x.\n",
        ),
        CommandInput::Audio(_) => prompt.push_str(
            "Listen to the audio command and translate it into a `bpy` Python script compatible with Blender 4.x.\n",
        ),
    }
    prompt.push('\n');
    prompt.push_str(INSTRUCTIONS);
    prompt.push_str(&format!("\n    `{}`\n\n", ERROR_MARKER_LINE));

    let spoken = "the spoken command in the audio recording of this conversation";
    let command_text = command.text().unwrap_or(spoken);

    match reason {
        PromptReason::Initial => {
            prompt.push_str(&format!("**Command:** {}\n", command_text));
        }
        PromptReason::ExecutionFailed { category, detail } => {
            prompt.push_str("**Previous Script Failed Execution in Blender:**\n");
            prompt.push_str(&format!(
                "The script you generated for this command raised `{}: {}` when it was run.\n",
                category, detail
            ));
            prompt.push_str(
                "Analyze the error, then generate a corrected script that carries out the original command.\n\n",
            );
            prompt.push_str(&format!("**Original Command:** {}\n", command_text));
        }
        PromptReason::NothingUsable => {
            prompt.push_str("**Previous Attempt Failed:**\n");
            prompt.push_str("The previous attempt for this command returned nothing usable. Try again.\n\n");
            prompt.push_str(&format!("**Command:** {}\n", command_text));
        }
    }

    prompt.push_str("**Current Blender Context:**\n");
    prompt.push_str(&context.describe());
    prompt.push_str("\n\n**Script:**\n");
    prompt
}
