use chrono::Utc;
use rust_decimal::Decimal;

use crate::domain::{
    Assignee, Error, Money, Profile, Response, ResponseStatus, Task, TaskId, TaskStatus, Team,
    TeamId, UserId,
};
use crate::journal::JournaledMap;

/// The price an assignee committed to, and who gets paid for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commitment {
    pub executor_id: UserId,
    pub team_id: Option<TeamId>,
    pub price: Money,
}

/// Tasks, responses, teams and executor profiles. Task status only changes
/// through the guarded transitions below.
#[derive(Debug, Clone, Default)]
pub struct TaskBoard {
    tasks: JournaledMap<TaskId, Task>,
    responses: JournaledMap<(TaskId, UserId), Response>,
    teams: JournaledMap<TeamId, Team>,
    profiles: JournaledMap<UserId, Profile>,
}

impl TaskBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit(&mut self) {
        self.tasks.commit();
        self.responses.commit();
        self.teams.commit();
        self.profiles.commit();
    }

    pub fn rollback(&mut self) {
        self.tasks.rollback();
        self.responses.rollback();
        self.teams.rollback();
        self.profiles.rollback();
    }

    pub fn insert_task(&mut self, task: Task) -> Result<(), Error> {
        if task.status != TaskStatus::Open || task.is_assigned() {
            return Err(Error::Validation(format!(
                "task {} must be created open and unassigned",
                task.id
            )));
        }
        if self.tasks.contains_key(&task.id) {
            return Err(Error::Validation(format!("task {} already exists", task.id)));
        }
        self.tasks.insert(task.id, task);
        Ok(())
    }

    pub fn task(&self, task_id: TaskId) -> Result<&Task, Error> {
        self.tasks
            .get(&task_id)
            .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn upsert_team(&mut self, team: Team) {
        self.teams.insert(team.id, team);
    }

    pub fn upsert_profile(&mut self, profile: Profile) {
        self.profiles.insert(profile.user_id, profile);
    }

    pub fn profile(&self, user_id: UserId) -> Option<&Profile> {
        self.profiles.get(&user_id)
    }

    /// Executors without a profile are treated as level 1.
    pub fn level(&self, user_id: UserId) -> u32 {
        self.profile(user_id).map(|p| p.level).unwrap_or(1)
    }

    pub fn add_response(
        &mut self,
        task_id: TaskId,
        user_id: UserId,
        team_id: Option<TeamId>,
        price: Option<Money>,
    ) -> Result<(), Error> {
        let task = self.task(task_id)?;
        if task.status != TaskStatus::Open {
            return Err(Error::InvalidStateTransition {
                task_id,
                from: task.status,
                to: TaskStatus::Open,
            });
        }
        if task.customer_id == user_id {
            return Err(Error::Validation("customers cannot respond to their own task".into()));
        }
        if let Some(price) = price.filter(|p| !p.is_positive()) {
            return Err(Error::Validation(format!("price must be positive, got {}", price)));
        }
        self.responses.insert(
            (task_id, user_id),
            Response {
                task_id,
                user_id,
                team_id,
                price,
                status: ResponseStatus::Pending,
            },
        );
        Ok(())
    }

    pub fn accept_response(
        &mut self,
        task_id: TaskId,
        user_id: UserId,
        actor_id: UserId,
    ) -> Result<(), Error> {
        let task = self.task(task_id)?;
        if task.customer_id != actor_id {
            return Err(Error::Forbidden(format!(
                "user {} does not own task {}",
                actor_id, task_id
            )));
        }
        let response = self
            .responses
            .get_mut(&(task_id, user_id))
            .ok_or_else(|| {
                Error::NotFound(format!("response of user {} on task {}", user_id, task_id))
            })?;
        response.status = ResponseStatus::Accepted;
        Ok(())
    }

    pub fn responses_of(&self, user_id: UserId) -> impl Iterator<Item = &Response> {
        self.responses.values().filter(move |r| r.user_id == user_id)
    }

    /// Resolves the accepted price for a single executor, or for a team via
    /// its admin's response.
    pub fn committed_price(&self, task_id: TaskId, assignee: Assignee) -> Result<Commitment, Error> {
        let (responder, team_id) = match assignee {
            Assignee::Executor(user_id) => (user_id, None),
            Assignee::Team(team_id) => {
                let team = self
                    .teams
                    .get(&team_id)
                    .ok_or_else(|| Error::NotFound(format!("team {}", team_id)))?;
                (team.admin_id, Some(team_id))
            }
        };

        self.responses
            .values()
            .find(|r| {
                r.task_id == task_id
                    && r.user_id == responder
                    && r.status == ResponseStatus::Accepted
                    && (team_id.is_none() || r.team_id == team_id)
            })
            .and_then(|r| r.price)
            .map(|price| Commitment {
                executor_id: responder,
                team_id,
                price,
            })
            .ok_or(Error::NoPriceCommitted {
                task_id,
                assignee: responder,
            })
    }

    /// Drops the user's pending responses on tasks that are still open,
    /// except on `keep_task`. Returns how many were removed.
    pub fn withdraw_pending_responses(&mut self, user_id: UserId, keep_task: TaskId) -> usize {
        let tasks = &self.tasks;
        let stale = self.responses.keys_where(|r| {
            let open = tasks
                .get(&r.task_id)
                .is_some_and(|t| t.status == TaskStatus::Open);
            r.user_id == user_id
                && r.task_id != keep_task
                && r.status == ResponseStatus::Pending
                && open
        });
        for key in &stale {
            self.responses.remove(key);
        }
        stale.len()
    }

    /// Compare-and-set on the stored status.
    fn transition(
        &mut self,
        task_id: TaskId,
        expected: TaskStatus,
        next: TaskStatus,
    ) -> Result<&mut Task, Error> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))?;
        if task.status != expected || !expected.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                task_id,
                from: task.status,
                to: next,
            });
        }
        task.status = next;
        Ok(task)
    }

    /// `open -> in_progress`, recording the assignee and the escrowed price.
    pub fn start(
        &mut self,
        task_id: TaskId,
        commitment: Commitment,
        commission_rate: Option<Decimal>,
    ) -> Result<Task, Error> {
        if self.task(task_id)?.is_assigned() {
            return Err(Error::AlreadyAssigned(task_id));
        }
        if !commitment.price.is_positive() {
            return Err(Error::NoPriceCommitted {
                task_id,
                assignee: commitment.executor_id,
            });
        }
        let task = self.transition(task_id, TaskStatus::Open, TaskStatus::InProgress)?;
        task.executor_id = Some(commitment.executor_id);
        task.team_id = commitment.team_id;
        task.escrow_amount = commitment.price;
        task.commission_rate = commission_rate;
        Ok(task.clone())
    }

    /// Guard for `-> completed`: executor present and escrow held.
    pub fn check_settleable(&self, task_id: TaskId, from: TaskStatus) -> Result<&Task, Error> {
        let task = self.task(task_id)?;
        if task.status != from
            || !from.can_transition_to(TaskStatus::Completed)
            || task.executor_id.is_none()
            || !task.escrow_amount.is_positive()
        {
            return Err(Error::InvalidStateTransition {
                task_id,
                from: task.status,
                to: TaskStatus::Completed,
            });
        }
        Ok(task)
    }

    /// `in_progress|disputed -> completed`; escrow resets, price is stamped.
    pub fn finish(
        &mut self,
        task_id: TaskId,
        from: TaskStatus,
        capture_confirmed: Option<bool>,
    ) -> Result<Task, Error> {
        self.check_settleable(task_id, from)?;
        let task = self.transition(task_id, from, TaskStatus::Completed)?;
        task.price = Some(task.escrow_amount);
        task.escrow_amount = Money::ZERO;
        task.capture_confirmed = capture_confirmed;
        task.completed_at = Some(Utc::now());
        Ok(task.clone())
    }

    pub fn open_dispute(&mut self, task_id: TaskId) -> Result<Task, Error> {
        self.transition(task_id, TaskStatus::InProgress, TaskStatus::Disputed)
            .map(|t| t.clone())
    }

    /// `open -> cancelled` or `disputed -> cancelled`. Returns the task as it
    /// was before the escrow was cleared.
    pub fn cancel(&mut self, task_id: TaskId, from: TaskStatus) -> Result<Task, Error> {
        let task = self.transition(task_id, from, TaskStatus::Cancelled)?;
        let before = task.clone();
        task.escrow_amount = Money::ZERO;
        Ok(before)
    }

    pub fn mark_captured(&mut self, task_id: TaskId) -> Result<(), Error> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))?;
        task.capture_confirmed = Some(true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn money(v: &str) -> Money {
        Money::from_str(v).unwrap()
    }

    fn board_with_offer() -> TaskBoard {
        let mut board = TaskBoard::new();
        board.insert_task(Task::new(1, 10)).unwrap();
        board.add_response(1, 20, None, Some(money("600"))).unwrap();
        board.accept_response(1, 20, 10).unwrap();
        board
    }

    #[test]
    fn committed_price_requires_an_accepted_response() {
        let mut board = TaskBoard::new();
        board.insert_task(Task::new(1, 10)).unwrap();
        board.add_response(1, 20, None, Some(money("600"))).unwrap();

        let err = board
            .committed_price(1, Assignee::Executor(20))
            .unwrap_err();
        assert!(matches!(err, Error::NoPriceCommitted { task_id: 1, assignee: 20 }));

        board.accept_response(1, 20, 10).unwrap();
        let commitment = board.committed_price(1, Assignee::Executor(20)).unwrap();
        assert_eq!(commitment.price, money("600"));
    }

    #[test]
    fn team_price_comes_from_the_admin() {
        let mut board = TaskBoard::new();
        board.insert_task(Task::new(1, 10)).unwrap();
        board.upsert_team(Team {
            id: 3,
            admin_id: 30,
            members: vec![30, 31],
        });
        board.add_response(1, 30, Some(3), Some(money("900"))).unwrap();
        board.accept_response(1, 30, 10).unwrap();

        let commitment = board.committed_price(1, Assignee::Team(3)).unwrap();
        assert_eq!(commitment.executor_id, 30);
        assert_eq!(commitment.team_id, Some(3));
    }

    #[test]
    fn second_start_reports_already_assigned() {
        let mut board = board_with_offer();
        let commitment = board.committed_price(1, Assignee::Executor(20)).unwrap();

        let task = board.start(1, commitment, None).unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.escrow_amount, money("600"));

        let err = board.start(1, commitment, None).unwrap_err();
        assert!(matches!(err, Error::AlreadyAssigned(1)));
    }

    #[test]
    fn finish_cannot_skip_in_progress() {
        let mut board = board_with_offer();
        let err = board.finish(1, TaskStatus::Open, None).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        assert_eq!(board.task(1).unwrap().status, TaskStatus::Open);
    }

    #[test]
    fn finish_resets_escrow_and_stamps_price() {
        let mut board = board_with_offer();
        let commitment = board.committed_price(1, Assignee::Executor(20)).unwrap();
        board.start(1, commitment, None).unwrap();

        let task = board.finish(1, TaskStatus::InProgress, Some(true)).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.escrow_amount, Money::ZERO);
        assert_eq!(task.price, Some(money("600")));
    }

    #[test]
    fn withdraw_pending_responses_keeps_the_assigned_task() {
        let mut board = board_with_offer();
        board.insert_task(Task::new(2, 11)).unwrap();
        board.add_response(2, 20, None, Some(money("100"))).unwrap();

        assert_eq!(board.withdraw_pending_responses(20, 1), 1);
        assert_eq!(board.responses_of(20).count(), 1);
    }
}
