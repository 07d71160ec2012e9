use anyhow::{bail, Context, Result};
use bjasync::{InputDirective, InputOrigin, OutputDirective, Task, TaskId, TaskRef, TransferMode};
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::Path,
};

/// Archivo de carga de trabajo: una lista de tareas en orden.
/// Una tarea sólo puede leer de tareas declaradas antes que ella.
#[derive(Debug, Deserialize)]
pub struct Workload {
    pub tasks: Vec<TaskEntry>,
}

#[derive(Debug, Deserialize)]
pub struct TaskEntry {
    pub name: String,
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default = "default_cores")]
    pub cores: u32,
    #[serde(default)]
    pub input: Vec<InputEntry>,
    #[serde(default)]
    pub output: Vec<OutputDirective>,
}

fn default_cores() -> u32 {
    1
}

/// Como `InputDirective`, pero la tarea de origen se nombra por su nombre.
#[derive(Debug, Deserialize)]
pub struct InputEntry {
    pub mode: TransferMode,
    pub origin: OriginEntry,
    pub origin_path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginEntry {
    Local,
    Remote,
    Task(String),
}

impl Workload {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("workload inválido")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("no se pudo leer el workload {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    /// Construye las tareas resolviendo los nombres de las productoras.
    pub fn build(self) -> Result<Vec<Task>> {
        let mut known: HashMap<String, TaskRef> = HashMap::new();
        let mut tasks = Vec::with_capacity(self.tasks.len());

        for entry in self.tasks {
            if known.contains_key(&entry.name) {
                bail!("tarea duplicada en el workload: '{}'", entry.name);
            }

            let mut input = Vec::with_capacity(entry.input.len());
            for i in entry.input {
                let origin = match i.origin {
                    OriginEntry::Local => InputOrigin::Local,
                    OriginEntry::Remote => InputOrigin::Remote,
                    OriginEntry::Task(name) => match known.get(&name) {
                        Some(r) => InputOrigin::Task(r.clone()),
                        None => bail!(
                            "la tarea '{}' lee de '{}', que no está declarada antes",
                            entry.name,
                            name
                        ),
                    },
                };
                input.push(InputDirective {
                    mode: i.mode,
                    origin,
                    origin_path: i.origin_path,
                });
            }

            let task = Task::new(entry.name.clone(), entry.executable)
                .with_arguments(entry.arguments)
                .with_environment(entry.environment)
                .with_cores(entry.cores)
                .with_input(input)
                .with_output(entry.output);

            known.insert(entry.name, task.reference());
            tasks.push(task);
        }

        Ok(tasks)
    }
}

/// Reparte las tareas round-robin entre `slots` asignaciones. Una tarea que
/// lee de otra va a la misma asignación que su productora.
pub fn dispatch(tasks: Vec<Task>, slots: usize) -> Vec<Vec<Task>> {
    let slots = slots.max(1);
    let mut batches: Vec<Vec<Task>> = (0..slots).map(|_| Vec::new()).collect();
    let mut placed: HashMap<TaskId, usize> = HashMap::new();
    let mut next = 0usize;

    for task in tasks {
        let affinity = task.input().iter().find_map(|d| match &d.origin {
            InputOrigin::Task(producer) => placed.get(&producer.id).copied(),
            _ => None,
        });
        let slot = affinity.unwrap_or_else(|| {
            let s = next % slots;
            next += 1;
            s
        });
        placed.insert(task.id(), slot);
        batches[slot].push(task);
    }

    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORKLOAD: &str = r#"{
        "tasks": [
            { "name": "producer", "executable": "/bin/date",
              "output": [ { "origin_path": "STDOUT", "destination": "local", "destination_path": "." } ] },
            { "name": "other", "executable": "/bin/hostname", "cores": 2 },
            { "name": "consumer", "executable": "/bin/cat", "arguments": ["STDOUT"],
              "environment": { "LANG": "C" },
              "input": [
                { "mode": "link", "origin": { "task": "producer" }, "origin_path": "STDOUT" },
                { "mode": "copy", "origin": "local", "origin_path": "README.md" }
              ] }
        ]
    }"#;

    #[test]
    fn workload_resuelve_las_productoras() {
        let tasks = Workload::from_json_str(WORKLOAD).unwrap().build().unwrap();
        assert_eq!(tasks.len(), 3);

        let consumer = &tasks[2];
        assert_eq!(consumer.arguments(), &["STDOUT".to_string()]);
        assert_eq!(consumer.environment()["LANG"], "C");
        match &consumer.input()[0].origin {
            InputOrigin::Task(r) => assert_eq!(r.id, tasks[0].id()),
            other => panic!("origen inesperado {:?}", other),
        }
        assert_eq!(consumer.input()[1].origin, InputOrigin::Local);
        assert_eq!(tasks[1].cores(), 2);
        assert_eq!(tasks[0].output().len(), 1);
    }

    #[test]
    fn referencia_a_tarea_posterior_es_error() {
        let raw = r#"{ "tasks": [
            { "name": "a", "executable": "/bin/cat",
              "input": [ { "mode": "copy", "origin": { "task": "b" }, "origin_path": "x" } ] },
            { "name": "b", "executable": "/bin/date" }
        ] }"#;
        let err = Workload::from_json_str(raw).unwrap().build().unwrap_err();
        assert!(err.to_string().contains("'b'"));
    }

    #[test]
    fn nombre_duplicado_es_error() {
        let raw = r#"{ "tasks": [
            { "name": "a", "executable": "/bin/date" },
            { "name": "a", "executable": "/bin/date" }
        ] }"#;
        assert!(Workload::from_json_str(raw).unwrap().build().is_err());
    }

    #[test]
    fn dispatch_round_robin_con_afinidad() {
        let tasks = Workload::from_json_str(WORKLOAD).unwrap().build().unwrap();
        let batches = dispatch(tasks, 2);

        let names: Vec<Vec<&str>> = batches
            .iter()
            .map(|b| b.iter().map(|t| t.name()).collect())
            .collect();
        // consumer sigue a producer aunque le tocaba la asignación 0 igual
        assert_eq!(names, vec![vec!["producer", "consumer"], vec!["other"]]);
    }

    #[test]
    fn afinidad_gana_sobre_el_turno() {
        let a = Task::new("a", "/bin/date");
        let b = Task::new("b", "/bin/date");
        let c = Task::new("c", "/bin/cat").with_input(vec![InputDirective::from_task(
            a.reference(),
            TransferMode::Copy,
            "STDOUT",
        )]);
        let batches = dispatch(vec![a, b, c], 2);

        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[0][1].name(), "c");
        assert_eq!(batches[1].len(), 1);
    }
}
