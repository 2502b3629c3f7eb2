use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::{FleetError, Result};
use crate::job::{Job, JobId, JobSpec, UserId};
use crate::store::{Compiler, JobFilter, NewProgram, NewUser, Program, Store, User};

#[derive(Debug, Default)]
struct Tables {
    jobs: BTreeMap<JobId, Job>,
    users: BTreeMap<UserId, User>,
    programs: BTreeMap<u64, Program>,
    compilers: BTreeMap<u64, Compiler>,
    next_job: JobId,
    next_user: UserId,
    next_program: u64,
    next_compiler: u64,
}

/// In-process store used by tests and throwaway coordinators.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|e| FleetError::Internal(format!("failed to acquire lock: {}", e)))
    }
}

impl Store for MemoryStore {
    fn add_job(&self, owner: UserId, spec: JobSpec) -> Result<Job> {
        let mut tables = self.tables()?;
        tables.next_job += 1;
        let job = Job::new(tables.next_job, owner, spec);
        tables.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.tables()?.jobs.get(&id).cloned())
    }

    fn save_job(&self, job: &Job) -> Result<()> {
        let mut tables = self.tables()?;
        if !tables.jobs.contains_key(&job.id) {
            return Err(FleetError::JobNotFound(job.id));
        }
        tables.jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        Ok(self
            .tables()?
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect())
    }

    fn add_user(&self, user: NewUser) -> Result<User> {
        let mut tables = self.tables()?;
        if tables.users.values().any(|u| u.email == user.email) {
            return Err(FleetError::PermissionDenied(format!(
                "user {} already exists",
                user.email
            )));
        }
        tables.next_user += 1;
        let user = User {
            id: tables.next_user,
            email: user.email,
            first_name: user.first_name,
            last_name: user.last_name,
            admin: user.admin,
        };
        tables.users.insert(user.id, user.clone());
        Ok(user)
    }

    fn user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.tables()?.users.get(&id).cloned())
    }

    fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self
            .tables()?
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    fn delete_user(&self, id: UserId) -> Result<bool> {
        Ok(self.tables()?.users.remove(&id).is_some())
    }

    fn users(&self) -> Result<Vec<User>> {
        Ok(self.tables()?.users.values().cloned().collect())
    }

    fn add_program(&self, program: NewProgram) -> Result<Program> {
        let mut tables = self.tables()?;
        if let Some(existing) = tables.programs.values().find(|p| p.name == program.name) {
            return Ok(existing.clone());
        }
        tables.next_program += 1;
        let program = Program {
            id: tables.next_program,
            name: program.name,
            executable: program.executable,
            path: program.path,
            version: program.version,
        };
        tables.programs.insert(program.id, program.clone());
        Ok(program)
    }

    fn delete_program(&self, name: &str) -> Result<bool> {
        let mut tables = self.tables()?;
        let before = tables.programs.len();
        tables.programs.retain(|_, p| p.name != name);
        Ok(tables.programs.len() != before)
    }

    fn programs(&self) -> Result<Vec<Program>> {
        Ok(self.tables()?.programs.values().cloned().collect())
    }

    fn add_compiler(&self, name: &str, description: &str) -> Result<Compiler> {
        let mut tables = self.tables()?;
        tables.next_compiler += 1;
        let compiler = Compiler {
            id: tables.next_compiler,
            name: name.to_string(),
            description: description.to_string(),
        };
        tables.compilers.insert(compiler.id, compiler.clone());
        Ok(compiler)
    }

    fn compilers(&self) -> Result<Vec<Compiler>> {
        Ok(self.tables()?.compilers.values().cloned().collect())
    }
}
