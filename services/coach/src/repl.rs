use lingo_core::event::UserAction;

pub const HELP: &str = "\
Commands:
  /begin      start the placement interview
  /talk       open the microphone (then type your answer)
  /stop       close the microphone
  /send       submit what you said
  /discard    throw it away
  /retry      record again
  /cancel     stop the coach talking
  /practice   start a practice conversation
  /done       leave practice for the dashboard
  /retake     forget your level and reassess
  /log        show recent session activity
  /quit       exit
Typing a line while it is your turn records and reviews it in one step.";

/// One line of terminal input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Action(UserAction),
    Speech(String),
    Help,
    Log,
    Quit,
    Blank,
    Unknown(String),
}

pub fn parse_line(raw: &str) -> Line {
    let line = raw.trim();
    if line.is_empty() {
        return Line::Blank;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Line::Speech(line.to_string());
    };
    let action = match command.trim().to_lowercase().as_str() {
        "begin" | "start" => UserAction::BeginAssessment,
        "talk" | "listen" => UserAction::StartListening,
        "stop" => UserAction::StopListening,
        "send" | "submit" => UserAction::Submit,
        "discard" => UserAction::Discard,
        "retry" => UserAction::RetryRecording,
        "cancel" | "skip" => UserAction::CancelSpeech,
        "practice" => UserAction::StartPractice,
        "done" | "finish" => UserAction::FinishPractice,
        "retake" => UserAction::RetakeAssessment,
        "help" | "?" => return Line::Help,
        "log" => return Line::Log,
        "quit" | "exit" => return Line::Quit,
        _ => return Line::Unknown(line.to_string()),
    };
    Line::Action(action)
}
