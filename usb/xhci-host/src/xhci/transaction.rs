//! Transfers in flight.
//!
//! Every TD that asks for a completion ends in an Event Data TRB whose data
//! field is the key of a [`Transaction`] in the transaction pool. The
//! resulting Transfer Event carries that key back, which is all the
//! dispatcher needs to find the buffer and the completion again.

use common::dma::BufferId;
use futures::channel::oneshot;
use log::{error, trace, warn};
use smallvec::SmallVec;

use super::context::endpoint_index;
use super::device::{Phase, Pipe};
use super::device_enumerator::EnumStep;
use super::trb::{Record, TrbCompletionCode};
use super::Xhci;
use crate::driver_interface::{
    PipeId, Transfer, TransferCallback, TransferFuture, TransferRequest, TransferResult,
};
use crate::error::{Error, Result};
use crate::usb::{EndpointTy, Setup};

pub(crate) enum Completion {
    Callback(TransferCallback),
    Enumeration(EnumStep),
    Reply(oneshot::Sender<TransferResult>),
}

pub(crate) struct Transaction {
    pub slot: u8,
    /// Device context index the TD was queued on.
    pub endpoint: u8,
    /// Taken when the completion runs; the entry itself stays until the
    /// completion has returned.
    pub completion: Option<Completion>,
    pub buffer: Option<BufferId>,
    /// Bytes requested.
    pub length: usize,
    pub input: bool,
    pub arg: u64,
}

impl<const N: usize> Xhci<N> {
    pub(crate) fn pipe(&self, id: PipeId) -> Result<Pipe> {
        self.pipes
            .lock()
            .get(id.0)
            .copied()
            .ok_or(Error::NoSuchPipe(id.0))
    }

    pub(crate) fn open_control_pipe(&self, slot: u8) -> Result<PipeId> {
        let pipe = Pipe {
            slot,
            endpoint: 1,
            ty: EndpointTy::Ctrl,
            input: false,
        };
        self.pipes
            .lock()
            .alloc(pipe)
            .map(PipeId)
            .ok_or(Error::Exhausted("pipes"))
    }

    pub(crate) fn open_endpoint_pipe(&self, slot: u8, address: u8) -> Result<PipeId> {
        let endpoint = endpoint_index(address)?;
        let mut dev = self.slot(slot)?.lock();
        if !dev.in_use() || dev.phase == Phase::Detaching {
            return Err(Error::NoSuchSlot(slot));
        }
        let descriptor = dev
            .endpoints
            .iter()
            .find(|desc| desc.address == address)
            .copied()
            .ok_or(Error::InvalidEndpoint(address))?;
        if dev.rings[usize::from(endpoint)].is_none() {
            return Err(Error::InvalidEndpoint(address));
        }

        let pipe = Pipe {
            slot,
            endpoint,
            ty: descriptor.ty(),
            input: descriptor.is_input(),
        };
        let id = self
            .pipes
            .lock()
            .alloc(pipe)
            .map(PipeId)
            .ok_or(Error::Exhausted("pipes"))?;
        dev.pipes.push(id);
        trace!("slot {}: pipe {} on endpoint {:#04x}", slot, id.0, address);
        Ok(id)
    }

    pub(crate) fn release_pipe(&self, id: PipeId) -> Result<()> {
        let pipe = {
            let mut pipes = self.pipes.lock();
            match pipes.get(id.0).map(|pipe| pipe.ty) {
                None => return Err(Error::NoSuchPipe(id.0)),
                Some(EndpointTy::Ctrl) => return Err(Error::WrongPipeKind),
                Some(_) => pipes.release(id.0),
            }
        };
        if let Ok(slot) = self.slot(pipe.slot) {
            slot.lock().pipes.retain(|open| *open != id);
        }
        Ok(())
    }

    /// Get a DMA buffer ready for `length` bytes; OUT data is copied in.
    fn stage_buffer(&self, length: usize, out: Option<&[u8]>) -> Result<Option<(BufferId, u64)>> {
        if length == 0 {
            return Ok(None);
        }
        let mut buffers = self.buffers.lock();
        let limit = buffers.buffer_size();
        if length > limit {
            return Err(Error::TransferTooLarge { length, limit });
        }
        let id = buffers.alloc().ok_or(Error::Exhausted("DMA buffers"))?;
        match out {
            Some(data) => buffers.fill(id, data, &*self.cache),
            None => buffers.prepare_read(id, &*self.cache),
        }
        Ok(Some((id, buffers.physical(id) as u64)))
    }

    fn release_buffer(&self, buffer: Option<BufferId>) {
        if let Some(id) = buffer {
            self.buffers.lock().release(id);
        }
    }

    fn begin(&self, transaction: Transaction) -> Result<usize> {
        let buffer = transaction.buffer;
        let key = self.transactions.lock().alloc(transaction);
        key.ok_or_else(|| {
            self.release_buffer(buffer);
            Error::Exhausted("transactions")
        })
    }

    /// Undo `begin` for a TD that never reached the ring.
    fn abort(&self, key: Option<usize>, buffer: Option<BufferId>) {
        if let Some(key) = key {
            let transaction = self.transactions.lock().release(key);
            drop(transaction);
        }
        self.release_buffer(buffer);
    }

    /// Write one TD to the ring of `endpoint` and ring its doorbell. The
    /// whole TD is placed before the link TRB.
    fn queue_td(&self, slot: u8, endpoint: u8, records: &[Record]) -> Result<()> {
        {
            let mut dev = self.slot(slot)?.lock();
            if matches!(dev.phase, Phase::Free | Phase::Detaching) {
                return Err(Error::NoSuchSlot(slot));
            }
            let ring = dev
                .ring_mut(endpoint)
                .ok_or(Error::InvalidEndpoint(endpoint))?;
            for (i, record) in records.iter().enumerate() {
                ring.push(records.len() - i, record);
            }
        }
        self.dbs.lock()[usize::from(slot)].ring(endpoint, 0);
        Ok(())
    }

    pub(crate) fn submit_control(
        &self,
        slot: u8,
        endpoint: u8,
        mut setup: Setup,
        data: &[u8],
        completion: Option<Completion>,
        arg: u64,
    ) -> Result<()> {
        let input = setup.is_device_to_host();
        let length = if input {
            usize::from(setup.length)
        } else {
            data.len()
        };
        if length > 0 && completion.is_none() {
            return Err(Error::CompletionRequired);
        }
        let buffer = self.stage_buffer(length, if input { None } else { Some(data) })?;
        let buffer_id = buffer.map(|(id, _)| id);
        setup.length = length as u16;

        let key = match completion {
            Some(completion) => Some(self.begin(Transaction {
                slot,
                endpoint,
                completion: Some(completion),
                buffer: buffer_id,
                length,
                input,
                arg,
            })?),
            None => None,
        };

        let mut records = SmallVec::<[Record; 4]>::new();
        records.push(Record::setup_stage(setup));
        if let Some((_, phys)) = buffer {
            records.push(Record::data_stage(phys, length as u32, input, 0));
        }
        records.push(Record::status_stage(!(length > 0 && input), key.is_some()));
        if let Some(key) = key {
            records.push(Record::event_data(key as u64));
        }

        self.queue_td(slot, endpoint, &records).map_err(|err| {
            self.abort(key, buffer_id);
            err
        })
    }

    pub(crate) fn submit_normal(
        &self,
        pipe: Pipe,
        request: TransferRequest<'_>,
        completion: Completion,
        arg: u64,
    ) -> Result<()> {
        if !matches!(pipe.ty, EndpointTy::Bulk | EndpointTy::Interrupt) {
            return Err(Error::WrongPipeKind);
        }
        let (input, out) = match request {
            TransferRequest::In(_) => (true, None),
            TransferRequest::Out(data) => (false, Some(data)),
        };
        if input != pipe.input {
            return Err(Error::WrongPipeKind);
        }
        let length = request.len();
        let (buffer, phys) = self
            .stage_buffer(length, out)?
            .ok_or(Error::EmptyTransfer)?;

        let key = self.begin(Transaction {
            slot: pipe.slot,
            endpoint: pipe.endpoint,
            completion: Some(completion),
            buffer: Some(buffer),
            length,
            input,
            arg,
        })?;

        let records = [
            Record::normal(phys, length as u32, 0, true),
            Record::event_data(key as u64),
        ];
        self.queue_td(pipe.slot, pipe.endpoint, &records)
            .map_err(|err| {
                self.abort(Some(key), Some(buffer));
                err
            })
    }

    /// A lone Event Data TRB: completes once the controller has worked
    /// through everything queued before it.
    pub(crate) fn submit_event(
        &self,
        slot: u8,
        endpoint: u8,
        completion: Completion,
        arg: u64,
    ) -> Result<()> {
        let key = self.begin(Transaction {
            slot,
            endpoint,
            completion: Some(completion),
            buffer: None,
            length: 0,
            input: false,
            arg,
        })?;
        self.queue_td(slot, endpoint, &[Record::event_data(key as u64)])
            .map_err(|err| {
                self.abort(Some(key), None);
                err
            })
    }

    pub(crate) fn control_on(&self, id: PipeId) -> Result<Pipe> {
        let pipe = self.pipe(id)?;
        if pipe.ty != EndpointTy::Ctrl {
            return Err(Error::WrongPipeKind);
        }
        Ok(pipe)
    }

    pub(crate) fn control_future(
        &self,
        id: PipeId,
        setup: Setup,
        data: &[u8],
    ) -> Result<TransferFuture> {
        let pipe = self.control_on(id)?;
        let (sender, future) = TransferFuture::new();
        self.submit_control(
            pipe.slot,
            pipe.endpoint,
            setup,
            data,
            Some(Completion::Reply(sender)),
            0,
        )?;
        Ok(future)
    }

    pub(crate) fn transfer_future(
        &self,
        id: PipeId,
        request: TransferRequest<'_>,
    ) -> Result<TransferFuture> {
        let pipe = self.pipe(id)?;
        let (sender, future) = TransferFuture::new();
        self.submit_normal(pipe, request, Completion::Reply(sender), 0)?;
        Ok(future)
    }

    pub(crate) fn sync_future(&self, id: PipeId) -> Result<TransferFuture> {
        let pipe = self.pipe(id)?;
        let (sender, future) = TransferFuture::new();
        self.submit_event(pipe.slot, pipe.endpoint, Completion::Reply(sender), 0)?;
        Ok(future)
    }

    /// Handle the Transfer Event of an Event Data TRB. `length` is the
    /// event data transfer length accumulated over the TD.
    pub(crate) fn complete_transaction(
        &self,
        key: usize,
        length: u32,
        code: TrbCompletionCode,
        slot: u8,
        endpoint: u8,
    ) {
        if !code.is_success() {
            // the TD stays outstanding; detaching the device reclaims it
            error!(
                "slot {} endpoint {}: transaction {} failed with {:?}",
                slot, endpoint, key, code
            );
            self.transfer_failed(slot);
            return;
        }

        let (completion, buffer, requested, input, arg, slot, endpoint) = {
            let mut transactions = self.transactions.lock();
            let transaction = match transactions.get_mut(key) {
                Some(transaction) => transaction,
                None => {
                    warn!("transfer event for lost transaction {}", key);
                    return;
                }
            };
            let completion = match transaction.completion.take() {
                Some(completion) => completion,
                None => {
                    warn!("transaction {} completed twice", key);
                    return;
                }
            };
            (
                completion,
                transaction.buffer,
                transaction.length,
                transaction.input,
                transaction.arg,
                transaction.slot,
                transaction.endpoint,
            )
        };

        let transferred = (length as usize).min(requested);
        let residual = requested - transferred;
        let data = match buffer {
            Some(id) if input => self.buffers.lock().read(id, transferred, &*self.cache),
            _ => Vec::new(),
        };
        trace!(
            "slot {} endpoint {}: transaction {} done, {} of {} bytes",
            slot,
            endpoint,
            key,
            transferred,
            requested
        );

        match completion {
            Completion::Callback(callback) => callback(
                self,
                &Transfer {
                    slot,
                    endpoint,
                    code,
                    residual,
                    arg,
                    data: &data,
                },
            ),
            Completion::Enumeration(step) => self.transfer_step(step, &data),
            Completion::Reply(sender) => {
                if sender
                    .send(TransferResult {
                        code,
                        residual,
                        data,
                    })
                    .is_err()
                {
                    trace!("transaction {}: future was dropped", key);
                }
            }
        }

        let finished = {
            let mut transactions = self.transactions.lock();
            if transactions.contains(key) {
                Some(transactions.release(key))
            } else {
                None
            }
        };
        if let Some(transaction) = finished {
            self.release_buffer(transaction.buffer);
        }
    }

    /// Drop every outstanding transaction of `slot`. Futures waiting on them
    /// resolve to [`Error::Cancelled`]; callbacks are never invoked.
    pub(crate) fn reclaim_transactions(&self, slot: u8) -> usize {
        let reclaimed: Vec<Transaction> = {
            let mut transactions = self.transactions.lock();
            transactions
                .keys_where(|transaction| transaction.slot == slot)
                .into_iter()
                .map(|key| transactions.release(key))
                .collect()
        };
        for transaction in &reclaimed {
            self.release_buffer(transaction.buffer);
        }
        reclaimed.len()
    }
}
