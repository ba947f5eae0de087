/// Greedily breaks `text` into lines no wider than `max_width`, as
/// reported by `measure`. Words are never split: a word wider than the
/// budget gets a line of its own and overflows it.
pub fn wrap_text<M: Fn(&str) -> usize>(text: &str, max_width: usize, measure: M) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if current.is_empty() {
            current.push_str(word);
            continue;
        }
        let candidate = format!("{current} {word}");
        if measure(&candidate) <= max_width {
            current = candidate;
        } else {
            lines.push(std::mem::replace(&mut current, word.to_string()));
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}
