#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use wisp_core::{
    BlockKind, Delta, DeltaOp, DeltaPath, ElementSpec, FormBlock, FormId, ForwardMsg,
    IndexedMessage, NewSession, ScriptFinished, ScriptFinishedStatus, ScriptRunId, WidgetId,
    WidgetSpec, WidgetValue,
};
use wisp_runtime::{AppSession, WispError};

#[derive(Debug, Arbitrary)]
enum Step {
    NewRun,
    AddWidget { path: Vec<u8>, id: u8, form: Option<u8> },
    AddForm { path: Vec<u8>, form: u8 },
    AddBlock { path: Vec<u8> },
    Remove { path: Vec<u8> },
    Finish { success: bool },
    UserWrite { id: u8, value: i16 },
    Submit { form: u8, button: u8 },
    Stop,
    EndOfTask,
}

fn path(raw: &[u8]) -> DeltaPath {
    DeltaPath::new(raw.iter().take(4).map(|&i| usize::from(i % 4)).collect::<Vec<_>>())
}

fn widget_id(n: u8) -> WidgetId {
    WidgetId::new(format!("w{}", n % 8))
}

fn form_id(n: u8) -> FormId {
    FormId::new(format!("f{}", n % 2))
}

fuzz_target!(|steps: Vec<Step>| {
    let mut session = AppSession::default();
    let mut index = 0u64;
    let mut run = 0u64;

    let mut send = |session: &mut AppSession, msg: ForwardMsg| {
        index += 1;
        session.handle_message(IndexedMessage::new(index, msg))
    };

    for step in steps.into_iter().take(256) {
        let result = match step {
            Step::NewRun => {
                run += 1;
                send(
                    &mut session,
                    ForwardMsg::NewSession(NewSession {
                        session_id: "fuzz".into(),
                        script_run_id: ScriptRunId::new(format!("r{run}")),
                        page_script_hash: "main".into(),
                        fragment_ids_this_run: Vec::new(),
                    }),
                )
            }
            Step::AddWidget { path: p, id, form } => {
                let mut spec = WidgetSpec::new(widget_id(id)).with_default(WidgetValue::Int(0));
                if let Some(form) = form {
                    spec = spec.in_form(form_id(form));
                }
                send(
                    &mut session,
                    ForwardMsg::Delta(Delta {
                        path: path(&p),
                        op: DeltaOp::AddElement(ElementSpec::widget("number_input", spec)),
                        fragment_id: None,
                    }),
                )
            }
            Step::AddForm { path: p, form } => send(
                &mut session,
                ForwardMsg::Delta(Delta {
                    path: path(&p),
                    op: DeltaOp::AddBlock(BlockKind::Form(FormBlock::new(form_id(form)))),
                    fragment_id: None,
                }),
            ),
            Step::AddBlock { path: p } => send(
                &mut session,
                ForwardMsg::Delta(Delta {
                    path: path(&p),
                    op: DeltaOp::AddBlock(BlockKind::Vertical),
                    fragment_id: None,
                }),
            ),
            Step::Remove { path: p } => send(
                &mut session,
                ForwardMsg::Delta(Delta {
                    path: path(&p),
                    op: DeltaOp::Remove,
                    fragment_id: None,
                }),
            ),
            Step::Finish { success } => send(
                &mut session,
                ForwardMsg::ScriptFinished(ScriptFinished {
                    script_run_id: ScriptRunId::new(format!("r{run}")),
                    status: if success {
                        ScriptFinishedStatus::Success
                    } else {
                        ScriptFinishedStatus::EarlyForRerun
                    },
                }),
            ),
            Step::UserWrite { id, value } => {
                let _ = session.set_value(&widget_id(id), WidgetValue::Int(i64::from(value)));
                continue;
            }
            Step::Submit { form, button } => {
                let _ = session.submit_form(&form_id(form), &widget_id(button));
                continue;
            }
            Step::Stop => {
                session.stop_script();
                continue;
            }
            Step::EndOfTask => {
                session.end_of_task();
                session.drain_outbound();
                continue;
            }
        };

        // Protocol errors end the session in production; stop here too.
        if let Err(WispError::ProtocolOrder(_) | WispError::Lifecycle(_)) = result {
            return;
        }

        // At most one state per widget, and every tree widget has one.
        for id in session.tree().widget_ids() {
            assert!(session.store().contains(&id), "tree widget {id} has no state");
        }
    }
});
