//! End-to-end: orchestrator → text-protocol provider → tool set with a
//! nested child.

use async_trait::async_trait;
use chatloop_runtime::{
    CatalogError, CompletionModel, Message, Orchestrator, ProviderError, Registration, Role,
    TextProtocolProvider, ToolArgs, ToolCatalog, ToolCatalogView, ToolSet,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Scripted {
    replies: Mutex<VecDeque<String>>,
    prompts: Arc<Mutex<Vec<Vec<Message>>>>,
}

#[async_trait]
impl CompletionModel for Scripted {
    async fn complete(
        &self,
        messages: Vec<Message>,
        _temperature: f32,
        _max_tokens: u32,
    ) -> Result<String, ProviderError> {
        self.prompts.lock().unwrap().push(messages);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::InvalidResponse("script exhausted".to_string()))
    }
}

/// Child tool set holding the files.
#[derive(Default)]
struct Disk {
    files: Mutex<HashMap<String, String>>,
}

impl ToolSet for Disk {
    fn register_tools(catalog: &mut ToolCatalog<Self>) -> Result<(), CatalogError> {
        catalog.register(
            Registration::new("write_file", "Write text to a file")
                .param("path", "string")
                .param("content", "string"),
            |disk, args: ToolArgs| {
                Box::pin(async move {
                    let path = args.string(0)?.to_string();
                    let content = args.string(1)?.to_string();
                    let bytes = content.len();
                    disk.files.lock().unwrap().insert(path.clone(), content);
                    Ok(format!("wrote {bytes} bytes to {path}"))
                })
            },
        )?;
        Ok(())
    }
}

struct Assistant {
    disk: Arc<Disk>,
}

impl ToolSet for Assistant {
    fn register_tools(catalog: &mut ToolCatalog<Self>) -> Result<(), CatalogError> {
        catalog.register(
            Registration::new("file_count", "Number of files written"),
            |this, _args| {
                Box::pin(async move { Ok(this.disk.files.lock().unwrap().len().to_string()) })
            },
        )?;
        Ok(())
    }

    fn nested(&self) -> Result<Vec<ToolCatalogView>, CatalogError> {
        Ok(vec![ToolCatalogView::of(self.disk.clone())?])
    }
}

fn setup(replies: &[&str]) -> (Orchestrator, Arc<Disk>, Arc<Mutex<Vec<Vec<Message>>>>) {
    let model = Scripted {
        replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
        prompts: Arc::default(),
    };
    let prompts = model.prompts.clone();
    let provider = Arc::new(TextProtocolProvider::new(Box::new(model), "scripted"));
    let disk = Arc::new(Disk::default());
    let assistant = Arc::new(Assistant { disk: disk.clone() });
    let orchestrator = Orchestrator::for_tool_set(provider, assistant)
        .unwrap()
        .with_instructions("You manage files.");
    (orchestrator, disk, prompts)
}

#[tokio::test]
async fn test_raw_block_reaches_nested_tool() {
    let (orchestrator, disk, prompts) = setup(&[
        "I will save it.\nTARGET system\n```\nwrite_file(\"poem.txt\", `roses are red\nviolets are blue`)\n```",
        "TARGET system\nfile_count()",
        "TARGET user\nSaved poem.txt.",
    ]);

    let answer = orchestrator.prompt("Save my poem").await.unwrap();

    assert_eq!(answer, "Saved poem.txt.");
    assert_eq!(
        disk.files.lock().unwrap().get("poem.txt").map(String::as_str),
        Some("roses are red\nviolets are blue")
    );

    let prompts = prompts.lock().unwrap();
    assert_eq!(prompts.len(), 3);
    let system = &prompts[0][0];
    assert_eq!(system.role, Role::System);
    assert!(system.content.starts_with("You manage files."));
    assert!(system.content.contains("write_file(path: string, content: string)"));
    assert!(system.content.contains("file_count()"));
    assert_eq!(
        prompts[1].last().unwrap(),
        &Message::user("RESULT wrote 30 bytes to poem.txt")
    );
    assert_eq!(prompts[2].last().unwrap(), &Message::user("RESULT 1"));
}

#[tokio::test]
async fn test_errors_are_fed_back_to_the_model() {
    let (orchestrator, disk, prompts) = setup(&[
        "TARGET system\nwrite_file(\"a.txt\"",
        "TARGET system\nwrite_file(\"a.txt\", 42)",
        "TARGET system\nformat_disk()",
        "TARGET user\nGiving up.",
    ]);

    let answer = orchestrator.prompt("Write a.txt").await.unwrap();

    assert_eq!(answer, "Giving up.");
    assert!(disk.files.lock().unwrap().is_empty());

    let prompts = prompts.lock().unwrap();
    let feedback: Vec<&str> = prompts[1..]
        .iter()
        .map(|p| p.last().unwrap().content.as_str())
        .collect();
    assert!(feedback[0].starts_with("ERROR Invalid call syntax"));
    assert_eq!(
        feedback[1],
        "ERROR Argument 'content' of tool 'write_file' must be a string"
    );
    assert_eq!(feedback[2], "RESULT Not implemented or not callable");
}

#[tokio::test]
async fn test_history_is_searchable() {
    let (orchestrator, _disk, _) = setup(&["TARGET user\nThe capital is Paris."]);
    orchestrator.prompt("What is the capital of France?").await.unwrap();

    let hits = orchestrator
        .search_history(Some("capital"), None)
        .await
        .unwrap();
    assert_eq!(hits.lines().filter(|l| l.starts_with('[')).count(), 2);
    assert!(hits.contains("user: What is the capital of France?"));
}
