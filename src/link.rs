/*!
    Multi-frame batching layer between the bus logic and the socket.

    Datagrams are accumulated into as many frames as needed, transmitted in
    sequence by [process_frames](Link::process_frames), and their replies are
    popped back in issue order by [next_datagram](Link::next_datagram),
    crossing frame boundaries transparently. This is what allows the bus
    controller to batch one datagram per slave and commit them in a handful
    of roundtrips.
*/

use crate::data::{Field, PduData};
use crate::error::{EthercatError, EthercatResult};
use crate::frame::{DatagramHeader, Frame, PduCommand, SlaveAddress, MAX_ETHERCAT_DATAGRAMS};
use crate::socket::EthercatSocket;

/// biggest payload the single-shot write helpers accept
const MAX_SINGLE_WRITE: usize = 256;

/// reply to a single-datagram exchange
#[derive(Copy, Clone, Debug)]
pub struct Answer<T> {
    /// number of slaves that processed the datagram (the working counter)
    pub answers: u16,
    /// payload circulated back
    pub value: T,
}

impl<T> Answer<T> {
    /// check that exactly one slave answered, as expected for unicast commands
    pub fn one(self) -> EthercatResult<T> {
        self.exactly(1)
    }
    /// check that exactly `expected` slaves answered
    pub fn exactly(self, expected: u16) -> EthercatResult<T> {
        if self.answers == expected {
            Ok(self.value)
        } else {
            Err(EthercatError::WorkingCounter {
                expected,
                received: self.answers,
            })
        }
    }
}

/**
    pipeline of frames over one socket

    The link owns the datagram index counter used to correlate replies with
    their issuers: every datagram going through it gets the next index, the
    counter wrapping naturally at 256.

    Batched and single-shot exchanges must not be interleaved: the replies of
    a batch are dropped by the first datagram added after
    [process_frames](Self::process_frames).
*/
pub struct Link<S: EthercatSocket> {
    socket: S,
    frames: Vec<Frame>,
    /// frame currently accumulating datagrams
    current: usize,
    /// frame currently yielding reply datagrams
    reading: usize,
    /// index for the next datagram
    index: u8,
    /// the batch was transmitted, the frames hold replies
    processed: bool,
}

impl<S: EthercatSocket> Link<S> {
    pub fn new(socket: S) -> Self {
        Self {
            socket,
            frames: vec![Frame::new()],
            current: 0,
            reading: 0,
            index: 0,
            processed: false,
        }
    }

    /// access to the underlying socket, to adjust its timeout
    pub fn socket(&self) -> &S {
        &self.socket
    }

    /// consume the link, releasing the underlying socket
    pub fn into_socket(self) -> S {
        self.socket
    }

    /**
        make sure enough frames are allocated to batch `datagrams` datagrams
        in a row without allocating on the add path

        twice the minimal frame count is reserved, so interleaved per-slave
        pairs (like the mailbox availability poll) always fit
    */
    pub fn reserve(&mut self, datagrams: usize) {
        let needed = (datagrams / MAX_ETHERCAT_DATAGRAMS + 1) * 2;
        while self.frames.len() < needed {
            self.frames.push(Frame::new());
        }
    }

    /// drop any accumulated datagrams and pending replies
    pub fn clear(&mut self) {
        for frame in &mut self.frames {
            frame.clear();
        }
        self.current = 0;
        self.reading = 0;
        self.processed = false;
    }

    /**
        append one datagram to the batch

        when the current frame cannot accept the datagram, the next frame is
        used. `length` bytes are sent, zero-padded if `data` is shorter or absent.
    */
    pub fn add_datagram(
        &mut self,
        command: PduCommand,
        slave: SlaveAddress,
        ado: u16,
        data: Option<&[u8]>,
        length: u16,
    ) -> EthercatResult<()> {
        if self.processed {
            // a new batch drops the previous replies
            self.clear();
        }

        let address = slave.physical(ado);
        let index = self.index;
        loop {
            let frame = match self.frames.get_mut(self.current) {
                Some(frame) => frame,
                None => {
                    self.frames.push(Frame::new());
                    self.frames.last_mut().unwrap()
                }
            };
            match frame.add_datagram(index, command, address, data, length) {
                Ok(()) => break,
                Err(EthercatError::FrameFull) if frame.datagram_count() != 0 => {
                    self.current += 1;
                }
                Err(err) => return Err(err),
            }
        }
        self.index = self.index.wrapping_add(1);
        Ok(())
    }

    /**
        transmit the accumulated frames in sequence, each waiting for its
        reply before the next is sent

        a socket failure discards the rest of the batch and surfaces the error
    */
    pub fn process_frames(&mut self) -> EthercatResult<()> {
        let mut result = Ok(());
        for frame in &mut self.frames {
            if frame.datagram_count() == 0 {
                break;
            }
            if let Err(err) = frame.write_then_read(&self.socket) {
                result = Err(err);
                break;
            }
        }
        if result.is_err() {
            self.clear();
        }
        self.current = 0;
        self.reading = 0;
        self.processed = true;
        result
    }

    /// pop the next reply datagram of the batch, in issue order, crossing frame boundaries
    pub fn next_datagram(&mut self) -> EthercatResult<(DatagramHeader, &[u8], u16)> {
        while self.reading < self.frames.len() && self.frames[self.reading].remaining_replies() == 0
        {
            self.reading += 1;
        }
        let frame = self
            .frames
            .get_mut(self.reading)
            .ok_or(EthercatError::Master("no reply datagram left in batch"))?;
        frame.next_datagram()
    }

    /// pop the next reply and unpack its payload to the given type
    pub fn next_value<T: PduData>(&mut self) -> EthercatResult<Answer<T>> {
        let (_, payload, wkc) = self.next_datagram()?;
        Ok(Answer {
            answers: wkc,
            value: T::unpack(payload)?,
        })
    }

    // single-shot exchanges, going through the batch machinery with one datagram

    fn read_one<T: PduData>(
        &mut self,
        command: PduCommand,
        slave: SlaveAddress,
        field: Field<T>,
    ) -> EthercatResult<Answer<T>> {
        self.add_datagram(command, slave, field.ado(), None, field.len as u16)?;
        self.process_frames()?;
        self.next_value()
    }

    fn write_one<T: PduData>(
        &mut self,
        command: PduCommand,
        slave: SlaveAddress,
        field: Field<T>,
        value: T,
    ) -> EthercatResult<u16> {
        if field.len > MAX_SINGLE_WRITE {
            return Err(EthercatError::Master("single-shot write too large"));
        }
        let mut buffer = [0u8; MAX_SINGLE_WRITE];
        value.pack(&mut buffer)?;
        self.add_datagram(
            command,
            slave,
            field.ado(),
            Some(&buffer[..field.len]),
            field.len as u16,
        )?;
        self.process_frames()?;
        let (_, _, wkc) = self.next_datagram()?;
        Ok(wkc)
    }

    /// broadcast read, the working counter counts the slaves that processed the datagram
    pub fn brd<T: PduData>(&mut self, field: Field<T>) -> EthercatResult<Answer<T>> {
        self.read_one(PduCommand::BRD, SlaveAddress::Broadcast, field)
    }

    /// broadcast write, returns the working counter
    pub fn bwr<T: PduData>(&mut self, field: Field<T>, value: T) -> EthercatResult<u16> {
        self.write_one(PduCommand::BWR, SlaveAddress::Broadcast, field, value)
    }

    /// fixed-address read from one slave
    pub fn fprd<T: PduData>(&mut self, slave: u16, field: Field<T>) -> EthercatResult<Answer<T>> {
        self.read_one(PduCommand::FPRD, SlaveAddress::Fixed(slave), field)
    }

    /// fixed-address write to one slave, returns the working counter
    pub fn fpwr<T: PduData>(
        &mut self,
        slave: u16,
        field: Field<T>,
        value: T,
    ) -> EthercatResult<u16> {
        self.write_one(PduCommand::FPWR, SlaveAddress::Fixed(slave), field, value)
    }
}
