/// Strips `//` line comments and `/* */` block comments from a JSON
/// document before it is handed to the parser. String literals are left
/// untouched, including escaped quotes. Newlines inside line comments are
/// preserved so parse errors keep meaningful line numbers.
pub fn strip_json_comments(input: &str) -> String {
    #[derive(PartialEq)]
    enum State {
        Normal,
        InString,
        InStringEscape,
        LineComment,
        BlockComment,
    }

    let mut out = String::with_capacity(input.len());
    let mut state = State::Normal;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Normal => match c {
                '"' => {
                    state = State::InString;
                    out.push(c);
                }
                '/' => match chars.peek() {
                    Some('/') => {
                        chars.next();
                        state = State::LineComment;
                    }
                    Some('*') => {
                        chars.next();
                        state = State::BlockComment;
                    }
                    _ => out.push(c),
                },
                _ => out.push(c),
            },
            State::InString => {
                out.push(c);
                match c {
                    '\\' => state = State::InStringEscape,
                    '"' => state = State::Normal,
                    _ => {}
                }
            }
            State::InStringEscape => {
                out.push(c);
                state = State::InString;
            }
            State::LineComment => {
                if c == '\n' {
                    out.push(c);
                    state = State::Normal;
                }
            }
            State::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = State::Normal;
                }
            }
        }
    }
    out
}
