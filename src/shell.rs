// Copyright 2016 Mozilla Foundation
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A small POSIX-style command tokenizer for the local runner command.
//! Handles single quotes, double quotes with backslash escapes, and
//! unquoted backslash escapes. No variable expansion, no globbing.

pub fn split_command(command: &str) -> Vec<String> {
    let chars: Vec<char> = command.chars().collect();
    let mut arguments = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        if chars[pos] == ' ' {
            pos += 1;
            continue;
        }

        let mut argument = String::new();
        while pos < chars.len() && chars[pos] != ' ' {
            match chars[pos] {
                '"' => {
                    pos += 1;
                    while pos < chars.len() {
                        match chars[pos] {
                            '"' => {
                                pos += 1;
                                break;
                            }
                            '\\' => {
                                pos += 1;
                                if pos < chars.len() {
                                    argument.push(chars[pos]);
                                    pos += 1;
                                }
                            }
                            c => {
                                argument.push(c);
                                pos += 1;
                            }
                        }
                    }
                }
                '\'' => {
                    // Everything up to the closing quote is literal; a
                    // missing closing quote consumes the rest.
                    pos += 1;
                    while pos < chars.len() && chars[pos] != '\'' {
                        argument.push(chars[pos]);
                        pos += 1;
                    }
                    if pos < chars.len() {
                        pos += 1;
                    }
                }
                '\\' => {
                    pos += 1;
                    if pos < chars.len() {
                        argument.push(chars[pos]);
                        pos += 1;
                    }
                }
                c => {
                    argument.push(c);
                    pos += 1;
                }
            }
        }
        arguments.push(argument);
    }

    arguments
}

#[cfg(test)]
mod test {
    use super::*;

    fn split(s: &str) -> Vec<String> {
        split_command(s)
    }

    #[test]
    fn test_simple() {
        assert_eq!(split("/my/runner --flag a"), ["/my/runner", "--flag", "a"]);
        assert_eq!(split("  spaced   out  "), ["spaced", "out"]);
        assert_eq!(split(""), Vec::<String>::new());
    }

    #[test]
    fn test_single_quotes() {
        assert_eq!(split("echo 'a b' c"), ["echo", "a b", "c"]);
        assert_eq!(split("'it\\'"), ["it\\"]);
        assert_eq!(split("a'b c'd"), ["ab cd"]);
    }

    #[test]
    fn test_double_quotes() {
        assert_eq!(split(r#"echo "a b" c"#), ["echo", "a b", "c"]);
        assert_eq!(split(r#""a\"b""#), [r#"a"b"#]);
        assert_eq!(split(r#""a\\b""#), [r"a\b"]);
    }

    #[test]
    fn test_unquoted_backslash() {
        assert_eq!(split(r"a\ b c"), ["a b", "c"]);
        assert_eq!(split(r"a\\b"), [r"a\b"]);
    }

    #[test]
    fn test_missing_closing_quote() {
        assert_eq!(split("'unterminated arg"), ["unterminated arg"]);
        assert_eq!(split(r#""unterminated arg"#), ["unterminated arg"]);
    }
}
