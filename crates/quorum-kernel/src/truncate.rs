const DEFAULT_MAX_OUTPUT: usize = 256 * 1024; // 256KB
const SHELL_MAX_OUTPUT: usize = 1024 * 1024; // 1MB

/// Max output size for a given tool name.
pub fn max_output_for_tool(tool_name: &str) -> usize {
    match tool_name {
        "shell" | "exec" => SHELL_MAX_OUTPUT,
        _ => DEFAULT_MAX_OUTPUT,
    }
}

/// Truncate tool output if it exceeds `max_bytes`, at a char boundary,
/// appending a marker with the original and truncated sizes.
pub fn truncate_output(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }
    let mut boundary = max_bytes;
    while boundary > 0 && !output.is_char_boundary(boundary) {
        boundary -= 1;
    }
    let truncated = &output[..boundary];
    format!(
        "{truncated}\n\n[truncated: {} bytes -> {} bytes]",
        output.len(),
        boundary
    )
}
